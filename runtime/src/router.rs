//! Lock and unlock notifications derived from the lease change feed.
//!
//! Only MODIFY records matter. The previous and next status are read from the
//! raw images, the pair is classified under the configured
//! [`TransitionModel`], and the lease snapshot from the `after` image is
//! published to the "locked" or "unlocked" topic.

use crate::fanout::FanoutInvoker;
use lease_pool_core::change_feed::{ChangeEventKind, ChangeFeedError, ChangeRecord};
use lease_pool_core::error::AggregateError;
use lease_pool_core::model::LeaseStatus;
use lease_pool_core::notification::{NotificationMessage, NotificationPublisher, PublishError};
use lease_pool_core::state_store::StateStore;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// How status pairs map to notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionModel {
    /// Leaving Active locks; every other change unlocks.
    TwoState,
    /// Active into a lock state locks; a lock state back to Active unlocks;
    /// everything else is silent.
    #[default]
    FourState,
}

impl FromStr for TransitionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "two-state" | "twostate" => Ok(Self::TwoState),
            "four-state" | "fourstate" => Ok(Self::FourState),
            other => Err(format!(
                "unknown transition model '{other}', expected two-state or four-state"
            )),
        }
    }
}

/// Notification a transition produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTopic {
    /// The lease became locked.
    Locked,
    /// The lease became unlocked.
    Unlocked,
}

impl fmt::Display for LockTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("locked"),
            Self::Unlocked => f.write_str("unlocked"),
        }
    }
}

impl TransitionModel {
    /// Classify a status change. `None` means no notification; equal
    /// statuses always yield `None`.
    #[must_use]
    pub fn classify(self, prev: LeaseStatus, next: LeaseStatus) -> Option<LockTopic> {
        if prev == next {
            return None;
        }
        match self {
            Self::TwoState => {
                if prev == LeaseStatus::Active {
                    Some(LockTopic::Locked)
                } else {
                    Some(LockTopic::Unlocked)
                }
            }
            Self::FourState => {
                if prev == LeaseStatus::Active && next.is_lock() {
                    Some(LockTopic::Locked)
                } else if prev.is_lock() && next == LeaseStatus::Active {
                    Some(LockTopic::Unlocked)
                } else {
                    None
                }
            }
        }
    }
}

/// Topics the router publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterTopics {
    /// Destination for [`LockTopic::Locked`].
    pub locked: String,
    /// Destination for [`LockTopic::Unlocked`].
    pub unlocked: String,
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not a MODIFY record.
    Ignored,
    /// Status did not change.
    Unchanged,
    /// Status changed but the model produces no notification.
    Suppressed {
        /// Previous status.
        prev: LeaseStatus,
        /// Next status.
        next: LeaseStatus,
    },
    /// A notification was published.
    Published {
        /// Which notification.
        topic: LockTopic,
        /// Broker-assigned message id.
        message_id: String,
    },
}

/// Failure routing one record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The record could not be decoded. Permanent.
    #[error(transparent)]
    Decode(#[from] ChangeFeedError),

    /// The notification was not published.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Routes lease change records to lock/unlock topics.
pub struct ChangeEventRouter {
    store: Arc<dyn StateStore>,
    publisher: Arc<dyn NotificationPublisher>,
    topics: RouterTopics,
    model: TransitionModel,
    fanout: FanoutInvoker,
}

impl ChangeEventRouter {
    /// Router publishing to `topics` under `model`. `store` is only read for
    /// diagnostics.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        publisher: Arc<dyn NotificationPublisher>,
        topics: RouterTopics,
        model: TransitionModel,
    ) -> Self {
        Self {
            store,
            publisher,
            topics,
            model,
            fanout: FanoutInvoker::new("change-feed"),
        }
    }

    /// The configured model.
    #[must_use]
    pub const fn model(&self) -> TransitionModel {
        self.model
    }

    /// Route every record, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns an [`AggregateError`] holding each failed record's error if
    /// any record failed.
    pub async fn handle_batch(
        &self,
        records: &[ChangeRecord],
    ) -> Result<Vec<RouteOutcome>, AggregateError<RouteError>> {
        let outcome = self
            .fanout
            .dispatch(records, |record| async move { self.handle_record(record).await })
            .await;
        outcome.into_result("Failed to handle change feed batch")
    }

    /// Route one record.
    ///
    /// # Errors
    ///
    /// - [`RouteError::Decode`] if a status attribute is missing or invalid,
    ///   or the `after` image is not a lease
    /// - [`RouteError::Publish`] if the notification was not published
    pub async fn handle_record(&self, record: &ChangeRecord) -> Result<RouteOutcome, RouteError> {
        if record.event_kind != ChangeEventKind::Modify {
            return Ok(RouteOutcome::Ignored);
        }

        let prev = record.previous_status()?;
        let next = record.next_status()?;
        if prev == next {
            tracing::debug!(status = %prev, "Lease status has not changed");
            return Ok(RouteOutcome::Unchanged);
        }

        let Some(topic) = self.model.classify(prev, next) else {
            tracing::debug!(%prev, %next, "Transition does not produce a notification");
            return Ok(RouteOutcome::Suppressed { prev, next });
        };

        let lease = record.after_lease()?;
        tracing::info!(
            account_id = %lease.account_id,
            principal_id = %lease.principal_id,
            %prev,
            %next,
            %topic,
            "Lease status transition"
        );

        match self.store.get_account(&lease.account_id).await {
            Ok(account) => {
                tracing::debug!(account_id = %account.id, account_status = %account.status, "Related account");
            }
            Err(err) => {
                tracing::warn!(account_id = %lease.account_id, error = %err, "Failed to read related account");
            }
        }

        let destination = match topic {
            LockTopic::Locked => &self.topics.locked,
            LockTopic::Unlocked => &self.topics.unlocked,
        };
        let message = NotificationMessage::from_snapshot(&lease)?;
        let message_id = self.publisher.publish(destination, &message).await?;

        metrics::counter!("lease_pool.router.published", "topic" => topic.to_string()).increment(1);
        Ok(RouteOutcome::Published { topic, message_id })
    }
}

impl std::fmt::Debug for ChangeEventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventRouter")
            .field("topics", &self.topics)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
