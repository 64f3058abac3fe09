//! Queue of accounts awaiting reset.
//!
//! The message body is the bare account id. Delivery is at-least-once, so the
//! consumer re-derives all state from the id and must be idempotent.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while enqueueing a reset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue did not accept the message.
    #[error("Failed to enqueue account {account_id} for reset: {reason}")]
    EnqueueFailed {
        /// Account that was not enqueued.
        account_id: String,
        /// Transport error text.
        reason: String,
    },
}

/// Producer side of the reset queue.
pub trait ResetQueue: Send + Sync {
    /// Enqueue `account_id` for reset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::EnqueueFailed`] if the message was not accepted.
    fn enqueue<'a>(
        &'a self,
        account_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;
}
