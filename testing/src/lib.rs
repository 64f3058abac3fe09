//! # Lease Pool Testing
//!
//! Testing utilities for the account lease pool.
//!
//! This crate provides:
//! - [`InMemoryStateStore`]: mutex-guarded `StateStore` with fault injection
//! - Recording doubles for the publisher, reset queue and collaborators
//! - Deterministic clocks and id generation
//! - [`fixtures`] for building accounts and leases

use chrono::{DateTime, Utc};
use lease_pool_core::environment::{Clock, IdGenerator};

pub mod doubles;
pub mod state_store;

pub use doubles::{
    InMemoryResetQueue, RecordingAccessGranter, RecordingBudgetChecker, RecordingPublisher,
    RecordingResetPipeline,
};
pub use state_store::{InMemoryStateStore, StoreOperation};

/// Mock implementations of the environment traits.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

    use super::{Clock, DateTime, IdGenerator, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use lease_pool_testing::mocks::FixedClock;
    /// use lease_pool_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }

    /// 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Predictable ids: `<prefix>-1`, `<prefix>-2`, ...
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Ids of the form `<prefix>-<n>`, starting at 1.
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl Default for SequentialIdGenerator {
        fn default() -> Self {
            Self::new("lease")
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("{}-{n}", self.prefix)
        }
    }
}

/// Builders for records used across tests.
pub mod fixtures {
    use lease_pool_core::model::{
        Account, AccountStatus, Lease, LeaseStatus, LeaseStatusReason,
    };

    /// Epoch seconds of [`crate::mocks::test_time`].
    pub const TEST_EPOCH: i64 = 1_735_689_600;

    /// Account in `status`, created at [`TEST_EPOCH`].
    #[must_use]
    pub fn account(id: &str, status: AccountStatus) -> Account {
        let mut account = Account::new(
            id,
            status,
            format!("arn:aws:iam::{id}:role/AdminRole"),
            TEST_EPOCH,
        );
        account.principal_role_arn = format!("arn:aws:iam::{id}:role/PrincipalRole");
        account
    }

    /// Lease in `status`, created at [`TEST_EPOCH`] and expiring a week later.
    #[must_use]
    pub fn lease(account_id: &str, principal_id: &str, status: LeaseStatus) -> Lease {
        let status_reason = match status {
            LeaseStatus::Inactive => LeaseStatusReason::Destroyed,
            _ => LeaseStatusReason::Active,
        };
        Lease {
            account_id: account_id.to_string(),
            principal_id: principal_id.to_string(),
            id: format!("{account_id}-{principal_id}"),
            status,
            status_reason,
            budget_amount: 100.0,
            budget_currency: "USD".to_string(),
            budget_notification_emails: vec![format!("{principal_id}@example.com")],
            created_on: TEST_EPOCH,
            last_modified_on: TEST_EPOCH,
            status_modified_on: TEST_EPOCH,
            expires_on: TEST_EPOCH + 7 * 24 * 60 * 60,
        }
    }
}

/// Install a test tracing subscriber writing to the test harness output.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, SequentialIdGenerator, test_clock, test_time};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now_epoch(), fixtures::TEST_EPOCH);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(test_time());
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now_epoch(), fixtures::TEST_EPOCH + 90);
    }

    #[test]
    fn sequential_ids() {
        let ids = SequentialIdGenerator::new("id");
        assert_eq!(ids.next_id(), "id-1");
        assert_eq!(ids.next_id(), "id-2");
    }
}
