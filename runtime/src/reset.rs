//! Account reset: the scheduled sweep that feeds the reset queue, and the
//! consumer that drains it.

use crate::fanout::FanoutInvoker;
use crate::pool::AccountPool;
use lease_pool_core::collaborators::{CollaboratorError, ResetPipeline};
use lease_pool_core::error::AggregateError;
use lease_pool_core::model::{LeaseStatus, LeaseStatusReason};
use lease_pool_core::reset_queue::{QueueError, ResetQueue};
use lease_pool_core::state_store::{StateStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// Failure while sweeping one account.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountSweepError {
    /// The account id was not enqueued.
    #[error(transparent)]
    Enqueue(#[from] QueueError),

    /// The account's finance lock could not be cleared.
    #[error("Failed to clear finance lock on account {account_id}: {source}")]
    FinanceLock {
        /// Account being swept.
        account_id: String,
        /// Store failure.
        source: StoreError,
    },
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// NotReady accounts found.
    pub accounts: usize,
    /// Accounts successfully enqueued.
    pub enqueued: usize,
    /// Finance locks moved back to Active.
    pub finance_locks_cleared: usize,
}

/// Errors returned by [`ResetDispatcher::sweep`].
#[derive(Error, Debug)]
pub enum SweepError {
    /// Listing NotReady accounts failed; nothing was enqueued.
    #[error("Failed to list accounts needing reset: {0}")]
    List(#[source] StoreError),

    /// Some accounts failed; the rest were processed.
    #[error("{errors}")]
    Partial {
        /// What did succeed.
        report: SweepReport,
        /// One cause per failed account.
        errors: AggregateError<AccountSweepError>,
    },
}

/// Re-queues NotReady accounts for reset and clears finance locks.
///
/// Enqueueing is at-least-once: an account already on the queue may be
/// enqueued again, and the consumer tolerates that.
pub struct ResetDispatcher {
    pool: AccountPool,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn ResetQueue>,
    fanout: FanoutInvoker,
}

impl ResetDispatcher {
    /// Dispatcher over `store`, feeding `queue`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn ResetQueue>) -> Self {
        Self {
            pool: AccountPool::new(Arc::clone(&store)),
            store,
            queue,
            fanout: FanoutInvoker::new("reset-sweep"),
        }
    }

    /// Enqueue every NotReady account and clear at most one finance lock per
    /// account.
    ///
    /// # Errors
    ///
    /// - [`SweepError::List`] if the accounts cannot be listed
    /// - [`SweepError::Partial`] if any account failed; the others were processed
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let accounts = self
            .pool
            .accounts_needing_reset()
            .await
            .map_err(SweepError::List)?;

        let outcome = self
            .fanout
            .dispatch(accounts, |account| async move {
                self.sweep_account(&account.id).await
            })
            .await;

        let report = SweepReport {
            accounts: outcome.attempted,
            enqueued: outcome.succeeded.len() + count_finance_failures(&outcome.failed),
            finance_locks_cleared: outcome.succeeded.iter().filter(|cleared| **cleared).count(),
        };
        metrics::counter!("lease_pool.reset.enqueued").increment(report.enqueued as u64);
        metrics::counter!("lease_pool.reset.finance_locks_cleared")
            .increment(report.finance_locks_cleared as u64);

        tracing::info!(
            accounts = report.accounts,
            enqueued = report.enqueued,
            finance_locks_cleared = report.finance_locks_cleared,
            failed = outcome.failed.len(),
            "Reset sweep complete"
        );

        match outcome.into_result("Failed to enqueue accounts for reset") {
            Ok(_) => Ok(report),
            Err(errors) => Err(SweepError::Partial { report, errors }),
        }
    }

    async fn sweep_account(&self, account_id: &str) -> Result<bool, AccountSweepError> {
        self.queue.enqueue(account_id).await?;
        tracing::debug!(account_id, "Added to reset queue");

        let finance_lock = |source| AccountSweepError::FinanceLock {
            account_id: account_id.to_string(),
            source,
        };
        let Some(lease) = self
            .pool
            .finance_locked_lease(account_id)
            .await
            .map_err(finance_lock)?
        else {
            return Ok(false);
        };

        self.store
            .transition_lease_status(
                account_id,
                &lease.principal_id,
                LeaseStatus::FinanceLock,
                LeaseStatus::Active,
                LeaseStatusReason::Active,
            )
            .await
            .map_err(finance_lock)?;
        tracing::info!(account_id, principal_id = %lease.principal_id, "Removed finance lock");
        Ok(true)
    }
}

// An account whose finance lock failed was still enqueued.
fn count_finance_failures(errors: &[AccountSweepError]) -> usize {
    errors
        .iter()
        .filter(|e| matches!(e, AccountSweepError::FinanceLock { .. }))
        .count()
}

impl std::fmt::Debug for ResetDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetDispatcher").finish_non_exhaustive()
    }
}

/// Failure while handling one reset-queue message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResetMessageError {
    /// The message body was empty.
    #[error("Reset message has an empty account id")]
    EmptyMessage,

    /// A lease could not be reset-locked.
    #[error("Failed to reset-lock leases of account {account_id}: {source}")]
    Lock {
        /// Account in the message.
        account_id: String,
        /// Store failure.
        source: StoreError,
    },

    /// The reset pipeline did not start.
    #[error("Failed to start reset of account {account_id}: {source}")]
    Pipeline {
        /// Account in the message.
        account_id: String,
        /// Collaborator failure.
        source: CollaboratorError,
    },
}

/// A reset that was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetResult {
    /// Account being reset.
    pub account_id: String,
    /// Leases moved into a reset lock.
    pub leases_locked: usize,
    /// Run id returned by the reset pipeline.
    pub run_id: String,
}

/// Errors returned by [`ResetQueueConsumer::handle_batch`].
#[derive(Error, Debug)]
#[error("{errors}")]
pub struct ResetBatchError {
    /// Resets that did start.
    pub completed: Vec<ResetResult>,
    /// One cause per failed message.
    pub errors: AggregateError<ResetMessageError>,
}

/// Consumes reset-queue messages.
///
/// Each message is handled from the account id alone, so redelivery is
/// harmless: leases already in a reset lock are left alone and the pipeline
/// is simply started again.
pub struct ResetQueueConsumer {
    pool: AccountPool,
    store: Arc<dyn StateStore>,
    pipeline: Arc<dyn ResetPipeline>,
    fanout: FanoutInvoker,
}

impl ResetQueueConsumer {
    /// Consumer over `store`, starting resets through `pipeline`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, pipeline: Arc<dyn ResetPipeline>) -> Self {
        Self {
            pool: AccountPool::new(Arc::clone(&store)),
            store,
            pipeline,
            fanout: FanoutInvoker::new("reset-queue"),
        }
    }

    /// Handle a batch of message bodies, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns [`ResetBatchError`] if any message failed; it carries the
    /// results of the messages that succeeded.
    pub async fn handle_batch<I, S>(&self, messages: I) -> Result<Vec<ResetResult>, ResetBatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let outcome = self
            .fanout
            .dispatch(messages, |body| async move {
                self.handle_message(body.as_ref()).await
            })
            .await;

        if outcome.failed.is_empty() {
            return Ok(outcome.succeeded);
        }
        Err(ResetBatchError {
            completed: outcome.succeeded,
            errors: AggregateError::new("Failed to process reset messages", outcome.failed),
        })
    }

    /// Reset-lock the account's leases, then start the reset pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ResetMessageError`] for an empty body, a failed lock, or a
    /// pipeline that did not start.
    pub async fn handle_message(&self, body: &str) -> Result<ResetResult, ResetMessageError> {
        let account_id = body.trim();
        if account_id.is_empty() {
            return Err(ResetMessageError::EmptyMessage);
        }

        let leases_locked = self.reset_lock(account_id).await?;

        let run_id = self
            .pipeline
            .start_reset(account_id)
            .await
            .map_err(|source| ResetMessageError::Pipeline {
                account_id: account_id.to_string(),
                source,
            })?;

        metrics::counter!("lease_pool.reset.started").increment(1);
        tracing::info!(account_id, run_id = %run_id, leases_locked, "Reset started");
        Ok(ResetResult {
            account_id: account_id.to_string(),
            leases_locked,
            run_id,
        })
    }

    async fn reset_lock(&self, account_id: &str) -> Result<usize, ResetMessageError> {
        let lock_error = |source| ResetMessageError::Lock {
            account_id: account_id.to_string(),
            source,
        };
        let leases = self
            .pool
            .leases_for_account(account_id)
            .await
            .map_err(lock_error)?;

        let mut locked = 0;
        for lease in leases {
            let next = match lease.status {
                LeaseStatus::Active => LeaseStatus::ResetLock,
                LeaseStatus::FinanceLock => LeaseStatus::ResetFinanceLock,
                _ => continue,
            };
            match self
                .store
                .transition_lease_status(
                    account_id,
                    &lease.principal_id,
                    lease.status,
                    next,
                    lease.status_reason,
                )
                .await
            {
                Ok(_) => locked += 1,
                // Moved by someone else since the read; nothing to lock.
                Err(err) if err.is_condition_failure() => {
                    tracing::debug!(account_id, error = %err, "Lease changed before reset lock");
                }
                Err(err) => return Err(lock_error(err)),
            }
        }
        Ok(locked)
    }
}

impl std::fmt::Debug for ResetQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetQueueConsumer").finish_non_exhaustive()
    }
}
