//! # Lease Pool Runtime
//!
//! The lease engine: independently invoked operations that mutate shared
//! account and lease records under concurrent access.
//!
//! ## Components
//!
//! - [`pool::AccountPool`]: queries over the state store
//! - [`provisioner::LeaseProvisioner`]: provision and decommission leases,
//!   with compensation on partial failure
//! - [`saga::Saga`]: ordered `(forward, compensation)` steps
//! - [`pipeline::MultiStepTaskRunner`]: ordered steps with fail-fast/continue policy
//! - [`fanout::FanoutInvoker`]: independent operations with aggregated errors
//! - [`reset::ResetDispatcher`] and [`reset::ResetQueueConsumer`]: reset sweep
//!   and reset-queue consumption
//! - [`budget::BudgetCheckFanout`]: budget checks across Active leases
//! - [`router::ChangeEventRouter`]: lock/unlock notifications from the change feed
//!
//! ## Concurrency
//!
//! Nothing here takes an in-process lock. Correctness rests on the store's
//! single-record compare-and-swap: of any concurrent callers moving a record
//! out of the same status, one wins and the rest receive a condition failure.
//! Nothing is retried internally.
//!
//! ## Example
//!
//! ```no_run
//! use lease_pool_runtime::environment::LeaseEnvironment;
//! use lease_pool_runtime::provisioner::{LeaseProvisioner, LeaseProvisionerConfig, ProvisionRequest};
//! use lease_pool_core::model::LeaseBudget;
//! use std::sync::Arc;
//!
//! # async fn example(env: LeaseEnvironment, access: Arc<dyn lease_pool_core::collaborators::AccessGranter>)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! let provisioner = LeaseProvisioner::new(env, access, LeaseProvisionerConfig::default());
//! let lease = provisioner
//!     .provision(ProvisionRequest::new("alice", LeaseBudget::new(100.0, "USD")))
//!     .await?;
//! println!("leased {} to {}", lease.account_id, lease.principal_id);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod environment;
pub mod fanout;
pub mod pipeline;
pub mod pool;
pub mod provisioner;
pub mod reset;
pub mod router;
pub mod saga;

pub use environment::LeaseEnvironment;
pub use fanout::FanoutInvoker;
pub use pipeline::MultiStepTaskRunner;
pub use pool::AccountPool;
pub use provisioner::{LeaseError, LeaseProvisioner};
pub use router::{ChangeEventRouter, TransitionModel};
pub use saga::Saga;
