//! # Lease Pool Worker
//!
//! Runs the lease pool's background work against `PostgreSQL` and Redpanda:
//!
//! - the reset sweep, re-queueing NotReady accounts on an interval
//! - the budget check fan-out over Active leases on an interval
//! - the change-feed consumer that publishes lock and unlock notifications
//! - the reset-queue consumer that reset-locks leases and starts cleanup
//!
//! Configuration comes from the environment; see [`config::Config`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod collaborators;
pub mod config;

pub use app::{Worker, WorkerError};
pub use config::{Config, ConfigError};
