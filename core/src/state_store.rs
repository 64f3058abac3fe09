//! Storage abstraction for account and lease records.
//!
//! # Design
//!
//! There are no multi-record transactions. Every status change is a
//! single-record compare-and-swap: the write lands only if the stored status
//! still equals the caller's `prev`. Of any number of concurrent callers moving
//! a record out of the same prior status, exactly one succeeds and the rest see
//! [`StoreError::ConditionFailure`]. Cross-record invariants (one Active lease
//! per account, Leased accounts have an Active lease) are maintained by the
//! callers' protocol on top of this primitive.
//!
//! # Implementations
//!
//! - `PostgresStateStore` (in `lease-pool-postgres`): `UPDATE ... WHERE status = $prev`
//! - `InMemoryStateStore` (in `lease-pool-testing`): mutex-guarded maps

use crate::model::{Account, AccountStatus, Lease, LeaseStatus, LeaseStatusReason};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Record family an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// An account record.
    Account,
    /// A lease record.
    Lease,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account => f.write_str("account"),
            Self::Lease => f.write_str("lease"),
        }
    }
}

/// Errors that can occur during state store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The conditional write did not apply: the stored value differs from the
    /// expected one, or the record does not exist.
    ///
    /// This is the signal of a lost race. It is never retried inside the core.
    #[error("Conditional write failed on {record} {key}: expected {expected}")]
    ConditionFailure {
        /// Record family.
        record: RecordKind,
        /// Record key (account id, or `account_id/principal_id`).
        key: String,
        /// The value the caller expected to find.
        expected: String,
    },

    /// A keyed read found no record.
    #[error("{record} not found: {key}")]
    NotFound {
        /// Record family.
        record: RecordKind,
        /// Record key.
        key: String,
    },

    /// Any other failure of the backing storage.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// `true` for [`StoreError::ConditionFailure`].
    #[must_use]
    pub const fn is_condition_failure(&self) -> bool {
        matches!(self, Self::ConditionFailure { .. })
    }

    /// Condition failure on an account status transition.
    #[must_use]
    pub fn account_condition(account_id: &str, expected: AccountStatus) -> Self {
        Self::ConditionFailure {
            record: RecordKind::Account,
            key: account_id.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Condition failure on a lease status transition.
    #[must_use]
    pub fn lease_condition(account_id: &str, principal_id: &str, expected: LeaseStatus) -> Self {
        Self::ConditionFailure {
            record: RecordKind::Lease,
            key: lease_key(account_id, principal_id),
            expected: expected.to_string(),
        }
    }
}

/// Display key of a lease record.
#[must_use]
pub fn lease_key(account_id: &str, principal_id: &str) -> String {
    format!("{account_id}/{principal_id}")
}

/// Typed access to account and lease records.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so components can hold an
/// `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Move an account from `prev` to `next`, stamping `last_modified_on`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConditionFailure`] if the stored status is not `prev`
    ///   or the account does not exist; the record is left unchanged
    /// - [`StoreError::Storage`] on any other failure
    fn transition_account_status<'a>(
        &'a self,
        account_id: &'a str,
        prev: AccountStatus,
        next: AccountStatus,
    ) -> StoreFuture<'a, Account>;

    /// Move a lease from `prev` to `next` with `reason`, stamping
    /// `status_modified_on` and `last_modified_on`.
    ///
    /// # Errors
    ///
    /// Same contract as [`StateStore::transition_account_status`], keyed by
    /// `(account_id, principal_id)`.
    fn transition_lease_status<'a>(
        &'a self,
        account_id: &'a str,
        principal_id: &'a str,
        prev: LeaseStatus,
        next: LeaseStatus,
        reason: LeaseStatusReason,
    ) -> StoreFuture<'a, Lease>;

    /// Compare-and-swap on the principal policy hash. `prev = None` means no
    /// hash has been stored yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConditionFailure`] if the stored hash differs from `prev`.
    fn update_account_principal_policy_hash<'a>(
        &'a self,
        account_id: &'a str,
        prev: Option<&'a str>,
        next: &'a str,
    ) -> StoreFuture<'a, Account>;

    /// Create an account record. Never overwrites an existing key.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConditionFailure`] if the key already exists.
    fn put_account<'a>(&'a self, account: &'a Account) -> StoreFuture<'a, ()>;

    /// Create a lease record. Never overwrites an existing key.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConditionFailure`] if `(account_id, principal_id)` or the
    /// lease id already exists.
    fn put_lease<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, ()>;

    /// Read one account.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn get_account<'a>(&'a self, account_id: &'a str) -> StoreFuture<'a, Account>;

    /// Read one lease by its key.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn get_lease<'a>(&'a self, account_id: &'a str, principal_id: &'a str)
    -> StoreFuture<'a, Lease>;

    /// Read one lease by its id.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn get_lease_by_id<'a>(&'a self, lease_id: &'a str) -> StoreFuture<'a, Lease>;

    /// Any Ready account, or `None`. Which one is unspecified.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on read failure.
    fn get_ready_account(&self) -> StoreFuture<'_, Option<Account>>;

    /// All accounts in `status`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on read failure.
    fn find_accounts_by_status(&self, status: AccountStatus) -> StoreFuture<'_, Vec<Account>>;

    /// All leases in `status`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on read failure.
    fn find_leases_by_status(&self, status: LeaseStatus) -> StoreFuture<'_, Vec<Lease>>;

    /// All leases held (in any status) by a principal.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on read failure.
    fn find_leases_by_principal<'a>(&'a self, principal_id: &'a str)
    -> StoreFuture<'a, Vec<Lease>>;

    /// All leases (in any status) on an account.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on read failure.
    fn find_leases_by_account<'a>(&'a self, account_id: &'a str) -> StoreFuture<'a, Vec<Lease>>;
}
