//! Injected dependencies shared by the lease components.

use lease_pool_core::environment::{Clock, IdGenerator};
use lease_pool_core::notification::{NotificationPublisher, NotificationTopics};
use lease_pool_core::reset_queue::ResetQueue;
use lease_pool_core::state_store::StateStore;
use std::sync::Arc;

/// Everything a lease operation talks to.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct LeaseEnvironment {
    /// Account and lease records.
    pub store: Arc<dyn StateStore>,
    /// Time source for new records.
    pub clock: Arc<dyn Clock>,
    /// Lease id source.
    pub ids: Arc<dyn IdGenerator>,
    /// Notification sink.
    pub publisher: Arc<dyn NotificationPublisher>,
    /// Accounts awaiting reset.
    pub reset_queue: Arc<dyn ResetQueue>,
    /// Notification topic names.
    pub topics: NotificationTopics,
}

impl std::fmt::Debug for LeaseEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseEnvironment")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}
