//! Queries over the state store.

use lease_pool_core::model::{Account, AccountStatus, Lease, LeaseStatus};
use lease_pool_core::state_store::{StateStore, StoreError};
use std::sync::Arc;

/// Read-side view of the account pool.
///
/// Results are a consistent snapshot at best; anything read here may be stale
/// by the time a caller acts on it, which is why every write goes through a
/// conditional transition.
#[derive(Clone)]
pub struct AccountPool {
    store: Arc<dyn StateStore>,
}

impl AccountPool {
    /// Pool over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Any Ready account.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn ready_account(&self) -> Result<Option<Account>, StoreError> {
        self.store.get_ready_account().await
    }

    /// Accounts waiting for reset.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn accounts_needing_reset(&self) -> Result<Vec<Account>, StoreError> {
        self.store
            .find_accounts_by_status(AccountStatus::NotReady)
            .await
    }

    /// Every lease on an account.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn leases_for_account(&self, account_id: &str) -> Result<Vec<Lease>, StoreError> {
        self.store.find_leases_by_account(account_id).await
    }

    /// Every lease held by a principal.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn leases_for_principal(&self, principal_id: &str) -> Result<Vec<Lease>, StoreError> {
        self.store.find_leases_by_principal(principal_id).await
    }

    /// Every lease in `status`.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn leases_with_status(&self, status: LeaseStatus) -> Result<Vec<Lease>, StoreError> {
        self.store.find_leases_by_status(status).await
    }

    /// The lease on `account_id` currently in FinanceLock, if any.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn finance_locked_lease(
        &self,
        account_id: &str,
    ) -> Result<Option<Lease>, StoreError> {
        Ok(self
            .leases_for_account(account_id)
            .await?
            .into_iter()
            .find(|lease| lease.status == LeaseStatus::FinanceLock))
    }
}

impl std::fmt::Debug for AccountPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountPool").finish_non_exhaustive()
    }
}
