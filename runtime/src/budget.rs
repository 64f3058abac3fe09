//! Budget checks across every Active lease.

use crate::fanout::FanoutInvoker;
use crate::pool::AccountPool;
use lease_pool_core::collaborators::{BudgetChecker, CollaboratorError};
use lease_pool_core::error::AggregateError;
use lease_pool_core::model::LeaseStatus;
use lease_pool_core::state_store::{StateStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// A budget check that failed for one lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Budget check failed for lease {lease_id} (account {account_id}): {source}")]
pub struct LeaseCheckError {
    /// Lease id.
    pub lease_id: String,
    /// Leased account.
    pub account_id: String,
    /// Collaborator failure.
    pub source: CollaboratorError,
}

/// Errors returned by [`BudgetCheckFanout::run`].
#[derive(Error, Debug)]
pub enum BudgetFanoutError {
    /// Listing Active leases failed; no check ran.
    #[error("Failed to list active leases: {0}")]
    List(#[source] StoreError),

    /// Some checks failed; the rest ran.
    #[error(transparent)]
    Partial(AggregateError<LeaseCheckError>),
}

/// Invokes the budget checker once per Active lease.
pub struct BudgetCheckFanout {
    pool: AccountPool,
    checker: Arc<dyn BudgetChecker>,
    fanout: FanoutInvoker,
}

impl BudgetCheckFanout {
    /// Fan-out over the leases in `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, checker: Arc<dyn BudgetChecker>) -> Self {
        Self {
            pool: AccountPool::new(store),
            checker,
            fanout: FanoutInvoker::new("budget-check"),
        }
    }

    /// Check every Active lease, returning how many were checked.
    ///
    /// # Errors
    ///
    /// - [`BudgetFanoutError::List`] if leases cannot be listed
    /// - [`BudgetFanoutError::Partial`] if any check failed
    pub async fn run(&self) -> Result<usize, BudgetFanoutError> {
        let leases = self
            .pool
            .leases_with_status(LeaseStatus::Active)
            .await
            .map_err(BudgetFanoutError::List)?;

        let outcome = self
            .fanout
            .dispatch(leases, |lease| async move {
                self.checker
                    .check_budget(&lease)
                    .await
                    .map_err(|source| LeaseCheckError {
                        lease_id: lease.id.clone(),
                        account_id: lease.account_id.clone(),
                        source,
                    })
            })
            .await;

        tracing::info!(
            checked = outcome.attempted,
            failed = outcome.failed.len(),
            "Budget check fan-out complete"
        );

        outcome
            .into_result("Failed to check lease budgets")
            .map(|checked| checked.len())
            .map_err(BudgetFanoutError::Partial)
    }
}

impl std::fmt::Debug for BudgetCheckFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetCheckFanout").finish_non_exhaustive()
    }
}
