//! External systems the engine calls but does not implement.
//!
//! Principal access (roles and policies), budget evaluation and the account
//! reset pipeline live outside this workspace; the engine only sees these
//! traits.

use crate::model::Lease;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by collaborator methods.
pub type CollaboratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{collaborator} failed: {reason}")]
pub struct CollaboratorError {
    /// Which collaborator failed.
    pub collaborator: &'static str,
    /// Error text.
    pub reason: String,
}

impl CollaboratorError {
    /// Build an error for `collaborator`.
    #[must_use]
    pub fn new(collaborator: &'static str, reason: impl Into<String>) -> Self {
        Self {
            collaborator,
            reason: reason.into(),
        }
    }
}

/// Grants the leasing principal access to the leased account.
pub trait AccessGranter: Send + Sync {
    /// Give `lease.principal_id` access to `lease.account_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if access could not be granted.
    fn grant_access<'a>(&'a self, lease: &'a Lease) -> CollaboratorFuture<'a, ()>;
}

/// Evaluates spend against a lease budget.
pub trait BudgetChecker: Send + Sync {
    /// Check the budget of one Active lease.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the check could not be performed.
    fn check_budget<'a>(&'a self, lease: &'a Lease) -> CollaboratorFuture<'a, ()>;
}

/// Starts the out-of-band cleanup of an account.
pub trait ResetPipeline: Send + Sync {
    /// Start resetting `account_id`, returning the pipeline's run id.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the run could not be started.
    fn start_reset<'a>(&'a self, account_id: &'a str) -> CollaboratorFuture<'a, String>;
}
