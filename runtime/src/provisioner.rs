//! Lease provisioning and decommissioning.
//!
//! # Provisioning
//!
//! 1. Validate the request; reject a principal that already holds a
//!    non-Inactive lease.
//! 2. Pick any Ready account.
//! 3. Decide between reactivating the principal's previous lease on that
//!    account and creating a new one.
//! 4. Reserve the account (Ready → Leased). Losing this race aborts with no
//!    compensation; nothing has been written.
//! 5. Activate the lease.
//! 6. Grant the principal access and publish the lease to the "created" topic.
//!
//! Steps 4-6 run as a [`Saga`]: once the account is reserved, any later
//! failure rolls the lease back to Inactive and returns the account to Ready.
//!
//! # Decommissioning
//!
//! Lease Active → Inactive, then account Leased → NotReady, then enqueue the
//! account for reset and publish to the "deleted" topic. The last two are
//! best-effort; the reset sweep re-enqueues any NotReady account.

use crate::environment::LeaseEnvironment;
use crate::pipeline::MultiStepTaskRunner;
use crate::pool::AccountPool;
use crate::saga::{Saga, SagaError, SagaStep};
use futures::future::BoxFuture;
use lease_pool_core::collaborators::{AccessGranter, CollaboratorError};
use lease_pool_core::model::{
    AccountStatus, Lease, LeaseBudget, LeaseStatus, LeaseStatusReason,
};
use lease_pool_core::notification::{NotificationMessage, PublishError};
use lease_pool_core::reset_queue::QueueError;
use lease_pool_core::state_store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by lease operations.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The request was rejected before any mutation.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The principal already holds a lease that is not Inactive.
    #[error("Principal {principal_id} already has an active lease for account {account_id}")]
    PrincipalBusy {
        /// Requesting principal.
        principal_id: String,
        /// Account of the existing lease.
        account_id: String,
    },

    /// No account is Ready.
    #[error("No accounts are available for leasing")]
    NoReadyAccount,

    /// The selected account already has an Active lease.
    #[error("Attempt to lease account {account_id}, which already has an active lease")]
    InvariantViolation {
        /// Offending account.
        account_id: String,
    },

    /// No lease exists for the principal on the account.
    #[error("No lease found for principal {principal_id} on account {account_id}")]
    NotFound {
        /// Principal.
        principal_id: String,
        /// Account.
        account_id: String,
    },

    /// The lease exists but is not Active.
    #[error("Lease for principal {principal_id} on account {account_id} is {status}, not Active")]
    LeaseNotActive {
        /// Principal.
        principal_id: String,
        /// Account.
        account_id: String,
        /// Current status.
        status: LeaseStatus,
    },

    /// State store failure, including lost conditional writes.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reset queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Notification failure.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// External collaborator failure.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// A step failed and rolling it back failed as well.
    #[error("{cause}; rollback also failed: {compensation}")]
    Compensation {
        /// The original failure.
        cause: Box<LeaseError>,
        /// The rollback failure.
        compensation: Box<LeaseError>,
    },
}

impl LeaseError {
    /// `true` when the operation lost a race and may simply be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_condition_failure())
    }

    /// `true` for errors caused by the request rather than the system.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::PrincipalBusy { .. }
                | Self::NotFound { .. }
                | Self::LeaseNotActive { .. }
        )
    }
}

/// Provisioner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseProvisionerConfig {
    /// Lease length applied when a request has no explicit expiry.
    pub default_lease_length_days: u32,
}

impl Default for LeaseProvisionerConfig {
    fn default() -> Self {
        Self {
            default_lease_length_days: 7,
        }
    }
}

/// A request to lease an account.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    /// Requesting principal.
    pub principal_id: String,
    /// Requested budget and expiry.
    pub budget: LeaseBudget,
}

impl ProvisionRequest {
    /// Request for `principal_id` with `budget`.
    #[must_use]
    pub fn new(principal_id: impl Into<String>, budget: LeaseBudget) -> Self {
        Self {
            principal_id: principal_id.into(),
            budget,
        }
    }

    /// Reject malformed requests.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Validation`] for an empty principal or currency,
    /// a negative or non-finite amount, or an expiry before `now`.
    pub fn validate(&self, now: i64) -> Result<(), LeaseError> {
        if self.principal_id.trim().is_empty() {
            return Err(LeaseError::Validation("principal id is required".into()));
        }
        if !self.budget.amount.is_finite() || self.budget.amount < 0.0 {
            return Err(LeaseError::Validation(format!(
                "budget amount must be a non-negative number, got {}",
                self.budget.amount
            )));
        }
        if self.budget.currency.trim().is_empty() {
            return Err(LeaseError::Validation("budget currency is required".into()));
        }
        if let Some(expires_on) = self.budget.expires_on {
            if expires_on < now {
                return Err(LeaseError::Validation(format!(
                    "requested lease expires on {expires_on}, which is in the past"
                )));
            }
        }
        Ok(())
    }
}

/// Orchestrates lease provisioning and decommissioning.
#[derive(Clone)]
pub struct LeaseProvisioner {
    env: LeaseEnvironment,
    pool: AccountPool,
    access: Arc<dyn AccessGranter>,
    config: LeaseProvisionerConfig,
}

impl std::fmt::Debug for LeaseProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseProvisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LeaseProvisioner {
    /// Provisioner over `env`, granting access through `access`.
    #[must_use]
    pub fn new(
        env: LeaseEnvironment,
        access: Arc<dyn AccessGranter>,
        config: LeaseProvisionerConfig,
    ) -> Self {
        let pool = AccountPool::new(Arc::clone(&env.store));
        Self {
            env,
            pool,
            access,
            config,
        }
    }

    /// A lease of `principal_id` whose status is anything but Inactive.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn find_active_lease_for_principal(
        &self,
        principal_id: &str,
    ) -> Result<Option<Lease>, LeaseError> {
        Ok(self
            .pool
            .leases_for_principal(principal_id)
            .await?
            .into_iter()
            .find(|lease| lease.status != LeaseStatus::Inactive))
    }

    /// The principal's previous lease on `account_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::InvariantViolation`] if any lease on the account
    /// is Active, since the account should not have been Ready.
    pub async fn find_lease_with_account(
        &self,
        principal_id: &str,
        account_id: &str,
    ) -> Result<Option<Lease>, LeaseError> {
        let leases = self.pool.leases_for_account(account_id).await?;
        if leases.iter().any(|lease| lease.status == LeaseStatus::Active) {
            tracing::error!(account_id, "Ready account already has an active lease");
            return Err(LeaseError::InvariantViolation {
                account_id: account_id.to_string(),
            });
        }
        Ok(leases
            .into_iter()
            .find(|lease| lease.principal_id == principal_id))
    }

    /// Make the principal's lease on `account_id` Active.
    ///
    /// With `create`, a new lease is written; otherwise the existing lease is
    /// moved Inactive → Active, keeping its id and creation time.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] if the write or transition fails.
    pub async fn activate_lease(
        &self,
        create: bool,
        principal_id: &str,
        account_id: &str,
        budget: &LeaseBudget,
    ) -> Result<Lease, LeaseError> {
        if !create {
            let lease = self
                .env
                .store
                .transition_lease_status(
                    account_id,
                    principal_id,
                    LeaseStatus::Inactive,
                    LeaseStatus::Active,
                    LeaseStatusReason::Active,
                )
                .await?;
            tracing::info!(account_id, principal_id, lease_id = %lease.id, "Lease reactivated");
            return Ok(lease);
        }

        let now = self.env.clock.now();
        let expires_on = budget.expires_on.unwrap_or_else(|| {
            let length = chrono::Duration::days(i64::from(self.config.default_lease_length_days));
            (now + length).timestamp()
        });
        let now = now.timestamp();
        let lease = Lease {
            account_id: account_id.to_string(),
            principal_id: principal_id.to_string(),
            id: self.env.ids.next_id(),
            status: LeaseStatus::Active,
            status_reason: LeaseStatusReason::Active,
            budget_amount: budget.amount,
            budget_currency: budget.currency.clone(),
            budget_notification_emails: budget.notification_emails.clone(),
            created_on: now,
            last_modified_on: now,
            status_modified_on: now,
            expires_on,
        };
        self.env.store.put_lease(&lease).await?;
        tracing::info!(account_id, principal_id, lease_id = %lease.id, "Lease created");
        Ok(lease)
    }

    /// Undo a partial provisioning.
    ///
    /// Always attempts lease Active → Inactive (reason Rollback) and, with
    /// `revert_account_status`, account Leased → Ready. Both are attempted
    /// regardless of each other. Running it again after success is a no-op on
    /// the records.
    ///
    /// # Errors
    ///
    /// Returns the lease error if that transition failed, else the account
    /// error.
    pub async fn rollback_provision_account(
        &self,
        revert_account_status: bool,
        principal_id: &str,
        account_id: &str,
    ) -> Result<(), LeaseError> {
        let (lease_result, account_result) = self
            .rollback_records(revert_account_status, principal_id, account_id)
            .await;
        lease_result?;
        account_result?;
        Ok(())
    }

    async fn rollback_records(
        &self,
        revert_account_status: bool,
        principal_id: &str,
        account_id: &str,
    ) -> (Result<(), StoreError>, Result<(), StoreError>) {
        metrics::counter!("lease_pool.provision.rollbacks").increment(1);

        let lease_result = self
            .env
            .store
            .transition_lease_status(
                account_id,
                principal_id,
                LeaseStatus::Active,
                LeaseStatus::Inactive,
                LeaseStatusReason::Rollback,
            )
            .await
            .map(|_| ());
        if let Err(err) = &lease_result {
            tracing::warn!(account_id, principal_id, error = %err, "Failed to roll back lease");
        }

        let account_result = if revert_account_status {
            self.env
                .store
                .transition_account_status(account_id, AccountStatus::Leased, AccountStatus::Ready)
                .await
                .map(|_| ())
        } else {
            Ok(())
        };
        if let Err(err) = &account_result {
            tracing::warn!(account_id, error = %err, "Failed to roll back account");
        }

        (lease_result, account_result)
    }

    /// Lease a Ready account to the requesting principal.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::Validation`] or [`LeaseError::PrincipalBusy`] before any mutation
    /// - [`LeaseError::NoReadyAccount`] if the pool is empty
    /// - [`LeaseError::InvariantViolation`] if the chosen account already has an Active lease
    /// - [`LeaseError::Store`] with a condition failure if another request
    ///   reserved the account first ([`LeaseError::is_retryable`])
    /// - any step error after the account was reserved, once rolled back, or
    ///   [`LeaseError::Compensation`] if the rollback failed too
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Lease, LeaseError> {
        let result = self.try_provision(&request).await;
        match &result {
            Ok(lease) => {
                metrics::counter!("lease_pool.provision.succeeded").increment(1);
                tracing::info!(
                    account_id = %lease.account_id,
                    principal_id = %lease.principal_id,
                    lease_id = %lease.id,
                    "Lease provisioned"
                );
            }
            Err(err) => {
                metrics::counter!("lease_pool.provision.failed").increment(1);
                tracing::warn!(principal_id = %request.principal_id, error = %err, "Provisioning failed");
            }
        }
        result
    }

    async fn try_provision(&self, request: &ProvisionRequest) -> Result<Lease, LeaseError> {
        request.validate(self.env.clock.now_epoch())?;

        if let Some(existing) = self
            .find_active_lease_for_principal(&request.principal_id)
            .await?
        {
            return Err(LeaseError::PrincipalBusy {
                principal_id: request.principal_id.clone(),
                account_id: existing.account_id,
            });
        }

        let account = self
            .pool
            .ready_account()
            .await?
            .ok_or(LeaseError::NoReadyAccount)?;

        let prior = self
            .find_lease_with_account(&request.principal_id, &account.id)
            .await?;

        let mut ctx = ProvisionContext {
            provisioner: self,
            request,
            account_id: account.id,
            create: prior.is_none(),
            lease: prior,
        };

        let saga: Saga<ProvisionContext<'_>, LeaseError> = Saga::new("provision")
            .step(ReserveAccount)
            .step(ActivateLease)
            .step(GrantAccess)
            .step(PublishCreated);

        saga.run(&mut ctx).await.map_err(
            |SagaError {
                 error,
                 compensation,
                 ..
             }| match compensation {
                None => error,
                Some(failure) => LeaseError::Compensation {
                    cause: Box::new(error),
                    compensation: Box::new(failure.error),
                },
            },
        )?;

        ctx.activated().cloned()
    }

    /// End a principal's Active lease on an account.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::Validation`] unless `reason` is Destroyed, Expired or OverBudget
    /// - [`LeaseError::NotFound`] / [`LeaseError::LeaseNotActive`] before any mutation
    /// - [`LeaseError::Store`] if the lease or account transition fails
    pub async fn decommission(
        &self,
        principal_id: &str,
        account_id: &str,
        reason: LeaseStatusReason,
    ) -> Result<Lease, LeaseError> {
        if !reason.is_decommission_reason() {
            return Err(LeaseError::Validation(format!(
                "{reason} is not a valid decommission reason"
            )));
        }

        let lease = match self.env.store.get_lease(account_id, principal_id).await {
            Ok(lease) => lease,
            Err(StoreError::NotFound { .. }) => {
                return Err(LeaseError::NotFound {
                    principal_id: principal_id.to_string(),
                    account_id: account_id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if lease.status != LeaseStatus::Active {
            return Err(LeaseError::LeaseNotActive {
                principal_id: principal_id.to_string(),
                account_id: account_id.to_string(),
                status: lease.status,
            });
        }

        let mut lease = self
            .env
            .store
            .transition_lease_status(
                account_id,
                principal_id,
                LeaseStatus::Active,
                LeaseStatus::Inactive,
                reason,
            )
            .await?;

        let mut runner = decommission_pipeline();
        let (all_succeeded, fatal) = runner.execute(&self.env, &mut lease).await;
        if let Some(err) = fatal {
            metrics::counter!("lease_pool.decommission.failed").increment(1);
            return Err(err);
        }
        if !all_succeeded {
            let errors: Vec<_> = runner.errors().iter().map(ToString::to_string).collect();
            tracing::warn!(
                account_id,
                principal_id,
                errors = ?errors,
                "Lease decommissioned with best-effort steps failing"
            );
        }

        metrics::counter!("lease_pool.decommission.succeeded").increment(1);
        tracing::info!(account_id, principal_id, lease_id = %lease.id, %reason, "Lease decommissioned");
        Ok(lease)
    }
}

fn decommission_pipeline() -> MultiStepTaskRunner<LeaseEnvironment, LeaseError> {
    let mut runner = MultiStepTaskRunner::<LeaseEnvironment, LeaseError>::new("decommission");
    runner.add_step("release-account", true, |env, lease| {
        Box::pin(async move {
            env.store
                .transition_account_status(
                    &lease.account_id,
                    AccountStatus::Leased,
                    AccountStatus::NotReady,
                )
                .await?;
            Ok(())
        })
    });
    runner.add_step("enqueue-reset", false, |env, lease| {
        Box::pin(async move {
            env.reset_queue.enqueue(&lease.account_id).await?;
            Ok(())
        })
    });
    runner.add_step("publish-deleted", false, |env, lease| {
        Box::pin(async move {
            let message = NotificationMessage::from_snapshot(&*lease)?;
            env.publisher.publish(&env.topics.deleted, &message).await?;
            Ok(())
        })
    });
    runner
}

struct ProvisionContext<'p> {
    provisioner: &'p LeaseProvisioner,
    request: &'p ProvisionRequest,
    account_id: String,
    create: bool,
    lease: Option<Lease>,
}

impl ProvisionContext<'_> {
    fn activated(&self) -> Result<&Lease, LeaseError> {
        self.lease
            .as_ref()
            .filter(|lease| lease.status == LeaseStatus::Active)
            .ok_or_else(|| LeaseError::NotFound {
                principal_id: self.request.principal_id.clone(),
                account_id: self.account_id.clone(),
            })
    }
}

type StepFuture<'a> = BoxFuture<'a, Result<(), LeaseError>>;

struct ReserveAccount;

impl<'p> SagaStep<ProvisionContext<'p>, LeaseError> for ReserveAccount {
    fn name(&self) -> &'static str {
        "reserve-account"
    }

    fn execute<'a>(&'a self, ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.provisioner
                .env
                .store
                .transition_account_status(
                    &ctx.account_id,
                    AccountStatus::Ready,
                    AccountStatus::Leased,
                )
                .await?;
            Ok(())
        })
    }

    // Releases both records. A condition failure on either side means that
    // record is already out of the state being undone.
    fn compensate<'a>(&'a self, ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async move {
            let (lease_result, account_result) = ctx
                .provisioner
                .rollback_records(true, &ctx.request.principal_id, &ctx.account_id)
                .await;
            for result in [lease_result, account_result] {
                match result {
                    Err(err) if !err.is_condition_failure() => return Err(err.into()),
                    Err(err) => tracing::debug!(error = %err, "Nothing to roll back"),
                    Ok(()) => {}
                }
            }
            Ok(())
        })
    }
}

struct ActivateLease;

impl<'p> SagaStep<ProvisionContext<'p>, LeaseError> for ActivateLease {
    fn name(&self) -> &'static str {
        "activate-lease"
    }

    fn execute<'a>(&'a self, ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async move {
            let lease = ctx
                .provisioner
                .activate_lease(
                    ctx.create,
                    &ctx.request.principal_id,
                    &ctx.account_id,
                    &ctx.request.budget,
                )
                .await?;
            ctx.lease = Some(lease);
            Ok(())
        })
    }

    fn compensate<'a>(&'a self, _ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        // Covered by reserve-account, which rolls back the lease with the account.
        Box::pin(async { Ok(()) })
    }
}

struct GrantAccess;

impl<'p> SagaStep<ProvisionContext<'p>, LeaseError> for GrantAccess {
    fn name(&self) -> &'static str {
        "grant-access"
    }

    fn execute<'a>(&'a self, ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async move {
            let lease = ctx.activated()?;
            ctx.provisioner.access.grant_access(lease).await?;
            Ok(())
        })
    }

    fn compensate<'a>(&'a self, _ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

struct PublishCreated;

impl<'p> SagaStep<ProvisionContext<'p>, LeaseError> for PublishCreated {
    fn name(&self) -> &'static str {
        "publish-created"
    }

    fn execute<'a>(&'a self, ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async move {
            let message = NotificationMessage::from_snapshot(ctx.activated()?)?;
            let env = &ctx.provisioner.env;
            env.publisher.publish(&env.topics.created, &message).await?;
            Ok(())
        })
    }

    fn compensate<'a>(&'a self, _ctx: &'a mut ProvisionContext<'p>) -> StepFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
