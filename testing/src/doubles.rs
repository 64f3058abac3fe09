//! Recording doubles for the publisher, reset queue and collaborators.
//!
//! Each double records what it was asked to do and can be told to fail for a
//! given key (topic, account id, lease id).

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use lease_pool_core::collaborators::{
    AccessGranter, BudgetChecker, CollaboratorError, CollaboratorFuture, ResetPipeline,
};
use lease_pool_core::model::Lease;
use lease_pool_core::notification::{NotificationMessage, NotificationPublisher, PublishError};
use lease_pool_core::reset_queue::{QueueError, ResetQueue};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// A message captured by [`RecordingPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Envelope as published.
    pub message: NotificationMessage,
}

impl PublishedMessage {
    /// The snapshot carried in the `Body` field, parsed as JSON.
    #[must_use]
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.message.body).unwrap()
    }
}

/// Publisher that records messages in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    fail_next: Arc<Mutex<usize>>,
}

impl RecordingPublisher {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish to `topic`.
    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }

    /// Reject the next `count` publishes regardless of topic.
    pub fn fail_next(&self, count: usize) {
        *self.fail_next.lock().unwrap() = count;
    }

    /// Everything published so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Messages published to `topic`.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    fn try_publish(
        &self,
        topic: &str,
        message: &NotificationMessage,
    ) -> Result<String, PublishError> {
        {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(PublishError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
        }
        if self.failing_topics.lock().unwrap().contains(topic) {
            return Err(PublishError::PublishFailed {
                topic: topic.to_string(),
                reason: "topic unavailable".to_string(),
            });
        }
        let mut published = self.published.lock().unwrap();
        published.push(PublishedMessage {
            topic: topic.to_string(),
            message: message.clone(),
        });
        Ok(format!("msg-{}", published.len()))
    }
}

impl NotificationPublisher for RecordingPublisher {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a NotificationMessage,
    ) -> Pin<Box<dyn Future<Output = Result<String, PublishError>> + Send + 'a>> {
        Box::pin(async move { self.try_publish(topic, message) })
    }
}

/// Reset queue that records enqueued account ids.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResetQueue {
    enqueued: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryResetQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject enqueues of `account_id`.
    pub fn fail_for(&self, account_id: &str) {
        self.failing.lock().unwrap().insert(account_id.to_string());
    }

    /// Accepted account ids, in order.
    #[must_use]
    pub fn enqueued(&self) -> Vec<String> {
        self.enqueued.lock().unwrap().clone()
    }
}

impl ResetQueue for InMemoryResetQueue {
    fn enqueue<'a>(
        &'a self,
        account_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(async move {
            if self.failing.lock().unwrap().contains(account_id) {
                return Err(QueueError::EnqueueFailed {
                    account_id: account_id.to_string(),
                    reason: "queue unavailable".to_string(),
                });
            }
            self.enqueued.lock().unwrap().push(account_id.to_string());
            Ok(())
        })
    }
}

/// Access granter that records grants.
#[derive(Debug, Clone, Default)]
pub struct RecordingAccessGranter {
    granted: Arc<Mutex<Vec<Lease>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingAccessGranter {
    /// Granter that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every grant fail.
    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }

    /// Leases access was granted for.
    #[must_use]
    pub fn granted(&self) -> Vec<Lease> {
        self.granted.lock().unwrap().clone()
    }
}

impl AccessGranter for RecordingAccessGranter {
    fn grant_access<'a>(&'a self, lease: &'a Lease) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            if *self.failing.lock().unwrap() {
                return Err(CollaboratorError::new("access granter", "role assumption denied"));
            }
            self.granted.lock().unwrap().push(lease.clone());
            Ok(())
        })
    }
}

/// Budget checker that records checked lease ids.
#[derive(Debug, Clone, Default)]
pub struct RecordingBudgetChecker {
    checked: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingBudgetChecker {
    /// Checker that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail checks of the lease with `lease_id`.
    pub fn fail_for(&self, lease_id: &str) {
        self.failing.lock().unwrap().insert(lease_id.to_string());
    }

    /// Ids of every lease a check was attempted for, including failures.
    #[must_use]
    pub fn checked(&self) -> Vec<String> {
        self.checked.lock().unwrap().clone()
    }
}

impl BudgetChecker for RecordingBudgetChecker {
    fn check_budget<'a>(&'a self, lease: &'a Lease) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            self.checked.lock().unwrap().push(lease.id.clone());
            if self.failing.lock().unwrap().contains(&lease.id) {
                return Err(CollaboratorError::new(
                    "budget checker",
                    format!("cost data unavailable for lease {}", lease.id),
                ));
            }
            Ok(())
        })
    }
}

/// Reset pipeline that records started runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingResetPipeline {
    started: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingResetPipeline {
    /// Pipeline that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail runs for `account_id`.
    pub fn fail_for(&self, account_id: &str) {
        self.failing.lock().unwrap().insert(account_id.to_string());
    }

    /// Account ids runs were started for.
    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

impl ResetPipeline for RecordingResetPipeline {
    fn start_reset<'a>(&'a self, account_id: &'a str) -> CollaboratorFuture<'a, String> {
        Box::pin(async move {
            if self.failing.lock().unwrap().contains(account_id) {
                return Err(CollaboratorError::new(
                    "reset pipeline",
                    format!("could not start build for {account_id}"),
                ));
            }
            let mut started = self.started.lock().unwrap();
            started.push(account_id.to_string());
            Ok(format!("reset-{account_id}-{}", started.len()))
        })
    }
}
