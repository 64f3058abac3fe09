//! Shared wiring for the runtime integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

use lease_pool_core::environment::Clock;
use lease_pool_core::notification::NotificationTopics;
use lease_pool_runtime::environment::LeaseEnvironment;
use lease_pool_runtime::provisioner::{LeaseProvisioner, LeaseProvisionerConfig};
use lease_pool_testing::mocks::{ManualClock, SequentialIdGenerator, test_time};
use lease_pool_testing::{
    InMemoryResetQueue, InMemoryStateStore, RecordingAccessGranter, RecordingPublisher,
};
use std::sync::Arc;
use tokio::sync::Barrier;

/// In-memory store, recording doubles and a clock that only moves on demand.
pub struct Harness {
    pub store: InMemoryStateStore,
    pub publisher: RecordingPublisher,
    pub queue: InMemoryResetQueue,
    pub access: RecordingAccessGranter,
    pub clock: Arc<ManualClock>,
    pub topics: NotificationTopics,
}

impl Harness {
    pub fn new() -> Self {
        lease_pool_testing::init_test_tracing();
        let clock = Arc::new(ManualClock::new(test_time()));
        let store = InMemoryStateStore::with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        Self::with_store(store, clock)
    }

    /// Harness whose `get_ready_account` holds `parties` callers until all
    /// of them have read the same Ready account.
    pub fn racing(parties: usize) -> Self {
        lease_pool_testing::init_test_tracing();
        let clock = Arc::new(ManualClock::new(test_time()));
        let store = InMemoryStateStore::with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .with_ready_barrier(Arc::new(Barrier::new(parties)));
        Self::with_store(store, clock)
    }

    fn with_store(store: InMemoryStateStore, clock: Arc<ManualClock>) -> Self {
        Self {
            store,
            publisher: RecordingPublisher::new(),
            queue: InMemoryResetQueue::new(),
            access: RecordingAccessGranter::new(),
            clock,
            topics: NotificationTopics::default(),
        }
    }

    pub fn env(&self) -> LeaseEnvironment {
        LeaseEnvironment {
            store: Arc::new(self.store.clone()),
            clock: Arc::clone(&self.clock) as Arc<dyn Clock>,
            ids: Arc::new(SequentialIdGenerator::new("lease")),
            publisher: Arc::new(self.publisher.clone()),
            reset_queue: Arc::new(self.queue.clone()),
            topics: self.topics.clone(),
        }
    }

    pub fn provisioner(&self) -> LeaseProvisioner {
        LeaseProvisioner::new(
            self.env(),
            Arc::new(self.access.clone()),
            LeaseProvisionerConfig::default(),
        )
    }
}
