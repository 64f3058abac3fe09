//! Notification topics and the publisher abstraction.
//!
//! Every notification carries a JSON snapshot of the record that changed,
//! wrapped in an envelope with a generic `default` payload and a
//! protocol-specific `Body` field. Both hold the same snapshot.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while publishing a notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The snapshot could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The broker rejected or failed to acknowledge the message.
    #[error("Failed to publish to topic '{topic}': {reason}")]
    PublishFailed {
        /// Destination topic.
        topic: String,
        /// Transport error text.
        reason: String,
    },
}

/// Wire envelope of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Generic payload for subscribers without a protocol-specific field.
    #[serde(rename = "default")]
    pub default: String,
    /// Protocol-specific payload.
    #[serde(rename = "Body")]
    pub body: String,
}

impl NotificationMessage {
    /// Envelope carrying `snapshot` serialized as JSON in both fields.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialization`] if `snapshot` fails to serialize.
    pub fn from_snapshot<T: Serialize + ?Sized>(snapshot: &T) -> Result<Self, PublishError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        Ok(Self {
            default: json.clone(),
            body: json,
        })
    }

    /// Encode the envelope itself as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialization`] on encoding failure.
    pub fn to_json(&self) -> Result<String, PublishError> {
        serde_json::to_string(self).map_err(|e| PublishError::Serialization(e.to_string()))
    }
}

/// Destination topics for lease notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTopics {
    /// A lease entered a lock state.
    pub locked: String,
    /// A lease left a lock state.
    pub unlocked: String,
    /// A lease was provisioned.
    pub created: String,
    /// A lease was decommissioned.
    pub deleted: String,
}

impl Default for NotificationTopics {
    fn default() -> Self {
        Self {
            locked: "lease-locked".to_string(),
            unlocked: "lease-unlocked".to_string(),
            created: "lease-created".to_string(),
            deleted: "lease-deleted".to_string(),
        }
    }
}

/// Publishes notifications to named topics.
///
/// Delivery is at-least-once; subscribers must tolerate duplicates.
pub trait NotificationPublisher: Send + Sync {
    /// Publish `message` to `topic`, returning the broker-assigned message id.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the message was not accepted.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a NotificationMessage,
    ) -> Pin<Box<dyn Future<Output = Result<String, PublishError>> + Send + 'a>>;
}
