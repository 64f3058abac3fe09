//! In-memory `StateStore` for fast, deterministic tests.
//!
//! A single mutex emulates the per-record atomicity of a conditional write.
//! Tests can queue failures per operation, count calls, and pause
//! `get_ready_account` on a barrier to force concurrent callers to pick the
//! same account.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use crate::mocks::test_clock;
use lease_pool_core::environment::Clock;
use lease_pool_core::model::{Account, AccountStatus, Lease, LeaseStatus, LeaseStatusReason};
use lease_pool_core::state_store::{RecordKind, StateStore, StoreError, StoreFuture, lease_key};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

/// Store operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `transition_account_status`
    TransitionAccountStatus,
    /// `transition_lease_status`
    TransitionLeaseStatus,
    /// `update_account_principal_policy_hash`
    UpdatePrincipalPolicyHash,
    /// `put_account`
    PutAccount,
    /// `put_lease`
    PutLease,
    /// `get_account`
    GetAccount,
    /// `get_lease`
    GetLease,
    /// `get_lease_by_id`
    GetLeaseById,
    /// `get_ready_account`
    GetReadyAccount,
    /// `find_accounts_by_status`
    FindAccountsByStatus,
    /// `find_leases_by_status`
    FindLeasesByStatus,
    /// `find_leases_by_principal`
    FindLeasesByPrincipal,
    /// `find_leases_by_account`
    FindLeasesByAccount,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<String, Account>,
    leases: BTreeMap<(String, String), Lease>,
    faults: HashMap<StoreOperation, VecDeque<StoreError>>,
    calls: HashMap<StoreOperation, usize>,
}

/// In-memory state store.
///
/// # Example
///
/// ```
/// use lease_pool_testing::{InMemoryStateStore, fixtures};
/// use lease_pool_core::model::AccountStatus;
/// use lease_pool_core::state_store::StateStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStateStore::new();
/// store.insert_account(fixtures::account("123", AccountStatus::Ready));
///
/// store
///     .transition_account_status("123", AccountStatus::Ready, AccountStatus::Leased)
///     .await?;
///
/// // A second caller with the same expectation loses.
/// let lost = store
///     .transition_account_status("123", AccountStatus::Ready, AccountStatus::Leased)
///     .await;
/// assert!(lost.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryStateStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
    ready_barrier: Option<Arc<Barrier>>,
}

impl std::fmt::Debug for InMemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock().unwrap();
        f.debug_struct("InMemoryStateStore")
            .field("accounts", &tables.accounts.len())
            .field("leases", &tables.leases.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryStateStore {
    /// Empty store stamped by [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Empty store stamping writes with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
            ready_barrier: None,
        }
    }

    /// Make `get_ready_account` wait on `barrier` after reading, so that
    /// concurrent callers observe the same snapshot.
    #[must_use]
    pub fn with_ready_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.ready_barrier = Some(barrier);
        self
    }

    /// Seed an account, replacing any existing record.
    pub fn insert_account(&self, account: Account) {
        self.tables
            .lock()
            .unwrap()
            .accounts
            .insert(account.id.clone(), account);
    }

    /// Seed a lease, replacing any existing record.
    pub fn insert_lease(&self, lease: Lease) {
        self.tables.lock().unwrap().leases.insert(
            (lease.account_id.clone(), lease.principal_id.clone()),
            lease,
        );
    }

    /// Current account record.
    #[must_use]
    pub fn account(&self, account_id: &str) -> Option<Account> {
        self.tables.lock().unwrap().accounts.get(account_id).cloned()
    }

    /// Current lease record.
    #[must_use]
    pub fn lease(&self, account_id: &str, principal_id: &str) -> Option<Lease> {
        self.tables
            .lock()
            .unwrap()
            .leases
            .get(&(account_id.to_string(), principal_id.to_string()))
            .cloned()
    }

    /// Every lease, ordered by key.
    #[must_use]
    pub fn leases(&self) -> Vec<Lease> {
        self.tables.lock().unwrap().leases.values().cloned().collect()
    }

    /// Fail the next call of `operation` with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, operation: StoreOperation, error: StoreError) {
        self.tables
            .lock()
            .unwrap()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// How many times `operation` was invoked, including failed calls.
    #[must_use]
    pub fn calls(&self, operation: StoreOperation) -> usize {
        self.tables
            .lock()
            .unwrap()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    fn with_tables<T>(
        &self,
        operation: StoreOperation,
        f: impl FnOnce(&mut Tables, i64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        *tables.calls.entry(operation).or_insert(0) += 1;
        if let Some(fault) = tables
            .faults
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(fault);
        }
        f(&mut tables, self.clock.now_epoch())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_not_found(account_id: &str, principal_id: &str) -> StoreError {
    StoreError::NotFound {
        record: RecordKind::Lease,
        key: lease_key(account_id, principal_id),
    }
}

impl StateStore for InMemoryStateStore {
    fn transition_account_status<'a>(
        &'a self,
        account_id: &'a str,
        prev: AccountStatus,
        next: AccountStatus,
    ) -> StoreFuture<'a, Account> {
        Box::pin(async move {
            self.with_tables(StoreOperation::TransitionAccountStatus, |t, now| {
                match t.accounts.get_mut(account_id) {
                    Some(account) if account.status == prev => {
                        account.status = next;
                        account.last_modified_on = now;
                        Ok(account.clone())
                    }
                    _ => Err(StoreError::account_condition(account_id, prev)),
                }
            })
        })
    }

    fn transition_lease_status<'a>(
        &'a self,
        account_id: &'a str,
        principal_id: &'a str,
        prev: LeaseStatus,
        next: LeaseStatus,
        reason: LeaseStatusReason,
    ) -> StoreFuture<'a, Lease> {
        Box::pin(async move {
            let key = (account_id.to_string(), principal_id.to_string());
            self.with_tables(StoreOperation::TransitionLeaseStatus, |t, now| {
                match t.leases.get_mut(&key) {
                    Some(lease) if lease.status == prev => {
                        lease.status = next;
                        lease.status_reason = reason;
                        lease.status_modified_on = now;
                        lease.last_modified_on = now;
                        Ok(lease.clone())
                    }
                    _ => Err(StoreError::lease_condition(account_id, principal_id, prev)),
                }
            })
        })
    }

    fn update_account_principal_policy_hash<'a>(
        &'a self,
        account_id: &'a str,
        prev: Option<&'a str>,
        next: &'a str,
    ) -> StoreFuture<'a, Account> {
        Box::pin(async move {
            self.with_tables(StoreOperation::UpdatePrincipalPolicyHash, |t, now| {
                match t.accounts.get_mut(account_id) {
                    Some(account) if account.principal_policy_hash.as_deref() == prev => {
                        account.principal_policy_hash = Some(next.to_string());
                        account.last_modified_on = now;
                        Ok(account.clone())
                    }
                    _ => Err(StoreError::ConditionFailure {
                        record: RecordKind::Account,
                        key: account_id.to_string(),
                        expected: format!("PrincipalPolicyHash = {}", prev.unwrap_or("<none>")),
                    }),
                }
            })
        })
    }

    fn put_account<'a>(&'a self, account: &'a Account) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_tables(StoreOperation::PutAccount, |t, _| {
                if t.accounts.contains_key(&account.id) {
                    return Err(StoreError::ConditionFailure {
                        record: RecordKind::Account,
                        key: account.id.clone(),
                        expected: "no existing record".to_string(),
                    });
                }
                t.accounts.insert(account.id.clone(), account.clone());
                Ok(())
            })
        })
    }

    fn put_lease<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_tables(StoreOperation::PutLease, |t, _| {
                let key = (lease.account_id.clone(), lease.principal_id.clone());
                if t.leases.contains_key(&key) || t.leases.values().any(|l| l.id == lease.id) {
                    return Err(StoreError::ConditionFailure {
                        record: RecordKind::Lease,
                        key: lease_key(&lease.account_id, &lease.principal_id),
                        expected: "no existing record".to_string(),
                    });
                }
                t.leases.insert(key, lease.clone());
                Ok(())
            })
        })
    }

    fn get_account<'a>(&'a self, account_id: &'a str) -> StoreFuture<'a, Account> {
        Box::pin(async move {
            self.with_tables(StoreOperation::GetAccount, |t, _| {
                t.accounts
                    .get(account_id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound {
                        record: RecordKind::Account,
                        key: account_id.to_string(),
                    })
            })
        })
    }

    fn get_lease<'a>(
        &'a self,
        account_id: &'a str,
        principal_id: &'a str,
    ) -> StoreFuture<'a, Lease> {
        Box::pin(async move {
            let key = (account_id.to_string(), principal_id.to_string());
            self.with_tables(StoreOperation::GetLease, |t, _| {
                t.leases
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| lease_not_found(account_id, principal_id))
            })
        })
    }

    fn get_lease_by_id<'a>(&'a self, lease_id: &'a str) -> StoreFuture<'a, Lease> {
        Box::pin(async move {
            self.with_tables(StoreOperation::GetLeaseById, |t, _| {
                t.leases
                    .values()
                    .find(|l| l.id == lease_id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound {
                        record: RecordKind::Lease,
                        key: lease_id.to_string(),
                    })
            })
        })
    }

    fn get_ready_account(&self) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let result = self.with_tables(StoreOperation::GetReadyAccount, |t, _| {
                Ok(t
                    .accounts
                    .values()
                    .find(|a| a.status == AccountStatus::Ready)
                    .cloned())
            });
            if let Some(barrier) = &self.ready_barrier {
                barrier.wait().await;
            }
            result
        })
    }

    fn find_accounts_by_status(&self, status: AccountStatus) -> StoreFuture<'_, Vec<Account>> {
        Box::pin(async move {
            self.with_tables(StoreOperation::FindAccountsByStatus, |t, _| {
                Ok(t
                    .accounts
                    .values()
                    .filter(|a| a.status == status)
                    .cloned()
                    .collect())
            })
        })
    }

    fn find_leases_by_status(&self, status: LeaseStatus) -> StoreFuture<'_, Vec<Lease>> {
        Box::pin(async move {
            self.with_tables(StoreOperation::FindLeasesByStatus, |t, _| {
                Ok(t
                    .leases
                    .values()
                    .filter(|l| l.status == status)
                    .cloned()
                    .collect())
            })
        })
    }

    fn find_leases_by_principal<'a>(
        &'a self,
        principal_id: &'a str,
    ) -> StoreFuture<'a, Vec<Lease>> {
        Box::pin(async move {
            self.with_tables(StoreOperation::FindLeasesByPrincipal, |t, _| {
                Ok(t
                    .leases
                    .values()
                    .filter(|l| l.principal_id == principal_id)
                    .cloned()
                    .collect())
            })
        })
    }

    fn find_leases_by_account<'a>(&'a self, account_id: &'a str) -> StoreFuture<'a, Vec<Lease>> {
        Box::pin(async move {
            self.with_tables(StoreOperation::FindLeasesByAccount, |t, _| {
                Ok(t
                    .leases
                    .values()
                    .filter(|l| l.account_id == account_id)
                    .cloned()
                    .collect())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use futures::future::join_all;

    #[tokio::test]
    async fn stale_prev_status_leaves_record_unchanged() {
        let store = InMemoryStateStore::new();
        store.insert_account(fixtures::account("123", AccountStatus::NotReady));

        let err = store
            .transition_account_status("123", AccountStatus::Ready, AccountStatus::Leased)
            .await
            .unwrap_err();

        assert!(err.is_condition_failure());
        assert_eq!(
            store.account("123"),
            Some(fixtures::account("123", AccountStatus::NotReady))
        );
    }

    #[tokio::test]
    async fn missing_record_is_a_condition_failure() {
        let store = InMemoryStateStore::new();
        let err = store
            .transition_lease_status(
                "123",
                "alice",
                LeaseStatus::Active,
                LeaseStatus::Inactive,
                LeaseStatusReason::Rollback,
            )
            .await
            .unwrap_err();
        assert!(err.is_condition_failure());
    }

    #[tokio::test]
    async fn concurrent_transitions_have_one_winner() {
        let store = InMemoryStateStore::new();
        store.insert_account(fixtures::account("123", AccountStatus::Ready));

        let attempts = (0..8).map(|_| {
            store.transition_account_status("123", AccountStatus::Ready, AccountStatus::Leased)
        });
        let results = join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(StoreError::is_condition_failure)
        );
    }

    #[tokio::test]
    async fn put_lease_refuses_existing_key() {
        let store = InMemoryStateStore::new();
        let lease = fixtures::lease("123", "alice", LeaseStatus::Active);
        store.put_lease(&lease).await.unwrap();

        let err = store.put_lease(&lease).await.unwrap_err();
        assert!(err.is_condition_failure());
    }

    #[tokio::test]
    async fn policy_hash_compare_and_swap() {
        let store = InMemoryStateStore::new();
        store.insert_account(fixtures::account("123", AccountStatus::Ready));

        store
            .update_account_principal_policy_hash("123", None, "v1")
            .await
            .unwrap();
        let err = store
            .update_account_principal_policy_hash("123", None, "v2")
            .await
            .unwrap_err();
        assert!(err.is_condition_failure());

        let account = store
            .update_account_principal_policy_hash("123", Some("v1"), "v2")
            .await
            .unwrap();
        assert_eq!(account.principal_policy_hash.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let store = InMemoryStateStore::new();
        store.fail_next(
            StoreOperation::GetReadyAccount,
            StoreError::Storage("throttled".into()),
        );

        assert!(store.get_ready_account().await.is_err());
        assert!(store.get_ready_account().await.unwrap().is_none());
        assert_eq!(store.calls(StoreOperation::GetReadyAccount), 2);
    }

    #[tokio::test]
    async fn keyed_reads_report_not_found() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.get_account("nope").await,
            Err(StoreError::NotFound { record: RecordKind::Account, .. })
        ));
        assert!(matches!(
            store.get_lease_by_id("nope").await,
            Err(StoreError::NotFound { record: RecordKind::Lease, .. })
        ));
    }
}
