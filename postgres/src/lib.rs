//! `PostgreSQL` state store for the account lease pool.
//!
//! Implements the `StateStore` trait from `lease-pool-core` on two tables,
//! `accounts` and `leases`. Every status change is a single conditional
//! `UPDATE ... WHERE status = $prev RETURNING ...`, so concurrent callers
//! racing on the same record resolve in the database: one row is returned,
//! every other caller gets a condition failure.
//!
//! # Example
//!
//! ```no_run
//! use lease_pool_core::environment::SystemClock;
//! use lease_pool_postgres::{PoolSettings, PostgresStateStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresStateStore::connect(
//!     "postgres://localhost/leases",
//!     PoolSettings::default(),
//!     Arc::new(SystemClock),
//! )
//! .await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod state_store;

pub use state_store::{PoolSettings, PostgresStateStore};
