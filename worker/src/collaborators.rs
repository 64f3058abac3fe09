//! Collaborators the worker reaches over the message bus.
//!
//! Budget evaluation and account cleanup run in separate services. The worker
//! starts them by publishing a command to their topic; the broker message id
//! doubles as the reset run id.

use lease_pool_core::collaborators::{
    BudgetChecker, CollaboratorError, CollaboratorFuture, ResetPipeline,
};
use lease_pool_core::model::Lease;
use lease_pool_core::notification::{NotificationMessage, NotificationPublisher};
use serde::Serialize;
use std::sync::Arc;

/// Requests a budget check by publishing the lease snapshot.
pub struct TopicBudgetChecker {
    publisher: Arc<dyn NotificationPublisher>,
    topic: String,
}

impl TopicBudgetChecker {
    /// Checker publishing to `topic`.
    #[must_use]
    pub fn new(publisher: Arc<dyn NotificationPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

impl BudgetChecker for TopicBudgetChecker {
    fn check_budget<'a>(&'a self, lease: &'a Lease) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            let message = NotificationMessage::from_snapshot(lease)
                .map_err(|e| CollaboratorError::new("budget-checker", e.to_string()))?;
            let message_id = self
                .publisher
                .publish(&self.topic, &message)
                .await
                .map_err(|e| CollaboratorError::new("budget-checker", e.to_string()))?;
            tracing::debug!(lease_id = %lease.id, %message_id, "Budget check requested");
            Ok(())
        })
    }
}

impl std::fmt::Debug for TopicBudgetChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicBudgetChecker")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ResetCommand<'a> {
    #[serde(rename = "AccountId")]
    account_id: &'a str,
}

/// Starts account resets by publishing a command naming the account.
pub struct TopicResetPipeline {
    publisher: Arc<dyn NotificationPublisher>,
    topic: String,
}

impl TopicResetPipeline {
    /// Pipeline publishing to `topic`.
    #[must_use]
    pub fn new(publisher: Arc<dyn NotificationPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

impl ResetPipeline for TopicResetPipeline {
    fn start_reset<'a>(&'a self, account_id: &'a str) -> CollaboratorFuture<'a, String> {
        Box::pin(async move {
            let message = NotificationMessage::from_snapshot(&ResetCommand { account_id })
                .map_err(|e| CollaboratorError::new("reset-pipeline", e.to_string()))?;
            self.publisher
                .publish(&self.topic, &message)
                .await
                .map_err(|e| CollaboratorError::new("reset-pipeline", e.to_string()))
        })
    }
}

impl std::fmt::Debug for TopicResetPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicResetPipeline")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
