//! # Lease Pool Core
//!
//! Domain model and abstractions for a pool of cloud accounts that are leased
//! to principals, reclaimed, reset and returned to the pool.
//!
//! The crate defines *what* the lease engine talks to, never *how*:
//!
//! - [`model`]: `Account` and `Lease` records with their status enums
//! - [`state_store`]: the `StateStore` trait, the only place a status may change,
//!   built on single-record compare-and-swap
//! - [`notification`]: the `NotificationPublisher` trait and message envelope
//! - [`reset_queue`]: the `ResetQueue` trait (message body = account id)
//! - [`change_feed`]: before/after change records observed on the lease table
//! - [`collaborators`]: external systems the engine calls but does not own
//! - [`environment`]: injected clock and id generation
//! - [`error`]: errors shared between components
//!
//! ## Example
//!
//! ```no_run
//! use lease_pool_core::model::AccountStatus;
//! use lease_pool_core::state_store::{StateStore, StoreError};
//!
//! async fn reserve<S: StateStore + ?Sized>(store: &S, id: &str) -> Result<(), StoreError> {
//!     // Succeeds for exactly one of any number of concurrent callers.
//!     store
//!         .transition_account_status(id, AccountStatus::Ready, AccountStatus::Leased)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub use chrono::{DateTime, Utc};

pub mod change_feed;
pub mod collaborators;
pub mod error;
pub mod model;
pub mod notification;
pub mod reset_queue;
pub mod state_store;

/// Environment traits - injected dependencies for deterministic tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use lease_pool_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// assert!(clock.now_epoch() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Current time as epoch seconds, the resolution records are stored at.
        fn now_epoch(&self) -> i64 {
            self.now().timestamp()
        }
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Generates record identifiers.
    pub trait IdGenerator: Send + Sync {
        /// Produce a new, globally unique identifier.
        fn next_id(&self) -> String;
    }

    /// UUID v4 identifiers.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn next_id(&self) -> String {
            uuid::Uuid::new_v4().to_string()
        }
    }
}
