//! Worker loops driven by in-memory doubles.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::{StreamExt, stream};
use lease_pool_core::change_feed::ChangeRecord;
use lease_pool_core::model::{AccountStatus, LeaseStatus};
use lease_pool_redpanda::{Delivery, OffsetCommit, RedpandaError};
use lease_pool_runtime::budget::BudgetCheckFanout;
use lease_pool_runtime::reset::{ResetDispatcher, ResetQueueConsumer};
use lease_pool_runtime::router::RouterTopics;
use lease_pool_runtime::{ChangeEventRouter, TransitionModel};
use lease_pool_testing::{
    InMemoryResetQueue, InMemoryStateStore, RecordingBudgetChecker, RecordingPublisher, fixtures,
};
use lease_pool_worker::Config;
use lease_pool_worker::app::{self, Worker};
use lease_pool_worker::collaborators::TopicResetPipeline;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

struct Setup {
    store: InMemoryStateStore,
    publisher: RecordingPublisher,
    queue: InMemoryResetQueue,
    worker: Arc<Worker>,
}

fn setup() -> Setup {
    let config = Config::from_lookup(|_| None).unwrap();
    let store = InMemoryStateStore::new();
    let publisher = RecordingPublisher::new();
    let queue = InMemoryResetQueue::new();
    let worker = Worker::assemble(
        &config,
        Arc::new(store.clone()),
        Arc::new(publisher.clone()),
        Arc::new(queue.clone()),
    )
    .unwrap();
    Setup {
        store,
        publisher,
        queue,
        worker: Arc::new(worker),
    }
}

// Records each committed offset with the number of messages published by then.
#[derive(Clone)]
struct CommitLog {
    commits: Arc<Mutex<Vec<(i64, usize)>>>,
    publisher: RecordingPublisher,
}

impl CommitLog {
    fn watching(publisher: &RecordingPublisher) -> Self {
        Self {
            commits: Arc::default(),
            publisher: publisher.clone(),
        }
    }

    fn deliver<T>(&self, offset: i64, message: Result<T, RedpandaError>) -> Delivery<T> {
        Delivery::new(
            message,
            LoggedOffset {
                offset,
                log: self.clone(),
            },
        )
    }

    fn committed(&self) -> Vec<(i64, usize)> {
        self.commits.lock().unwrap().clone()
    }
}

struct LoggedOffset {
    offset: i64,
    log: CommitLog,
}

impl OffsetCommit for LoggedOffset {
    fn commit(&self) {
        let published = self.log.publisher.published().len();
        self.log.commits.lock().unwrap().push((self.offset, published));
    }
}

fn transition(prev: LeaseStatus, next: LeaseStatus) -> ChangeRecord {
    ChangeRecord::modify(
        &fixtures::lease("1", "alice", prev),
        &fixtures::lease("1", "alice", next),
    )
}

#[tokio::test]
async fn change_feed_loop_routes_records_and_skips_undecodable_ones() {
    let setup = setup();
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let log = CommitLog::watching(&setup.publisher);
    let records = stream::iter(vec![
        log.deliver(0, Ok(transition(LeaseStatus::Active, LeaseStatus::ResetLock))),
        log.deliver(1, Err(RedpandaError::Decode("not json".to_string()))),
        log.deliver(2, Ok(transition(LeaseStatus::Inactive, LeaseStatus::Active))),
        log.deliver(3, Ok(transition(LeaseStatus::FinanceLock, LeaseStatus::Active))),
    ]);

    let router = Arc::new(ChangeEventRouter::new(
        Arc::new(setup.store.clone()),
        Arc::new(setup.publisher.clone()),
        RouterTopics {
            locked: "lease-locked".to_string(),
            unlocked: "lease-unlocked".to_string(),
        },
        TransitionModel::FourState,
    ));
    app::change_feed_loop(router, records, 2, shutdown).await;

    assert_eq!(setup.publisher.published_to("lease-locked").len(), 1);
    assert_eq!(setup.publisher.published_to("lease-unlocked").len(), 1);
    let offsets: Vec<i64> = log.committed().iter().map(|(offset, _)| *offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn worker_router_uses_configured_topics() {
    let setup = setup();

    setup
        .worker
        .router()
        .handle_record(&transition(LeaseStatus::Active, LeaseStatus::FinanceLock))
        .await
        .unwrap();

    let sent = setup.publisher.published_to("lease-locked");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body_json()["LeaseStatus"], "FinanceLock");
}

#[tokio::test]
async fn reset_queue_loop_locks_leases_and_starts_the_reset() {
    let setup = setup();
    setup
        .store
        .insert_lease(fixtures::lease("1", "alice", LeaseStatus::Active));
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let pipeline = TopicResetPipeline::new(Arc::new(setup.publisher.clone()), "account-reset-run");
    let consumer = Arc::new(ResetQueueConsumer::new(
        Arc::new(setup.store.clone()),
        Arc::new(pipeline),
    ));
    let log = CommitLog::watching(&setup.publisher);
    let requests = stream::iter(vec![
        log.deliver(7, Ok("1".to_string())),
        log.deliver(8, Err(RedpandaError::Decode("reset request is empty".to_string()))),
    ]);

    app::reset_queue_loop(consumer, requests, 10, shutdown).await;

    let lease = setup.store.lease("1", "alice").unwrap();
    assert_eq!(lease.status, LeaseStatus::ResetLock);
    let runs = setup.publisher.published_to("account-reset-run");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].body_json()["AccountId"], "1");
    // Both offsets are committed once the reset run was started.
    assert_eq!(log.committed(), vec![(7, 1), (8, 1)]);
}

#[tokio::test]
async fn change_feed_offsets_are_committed_after_the_batch_is_routed() {
    let setup = setup();
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let log = CommitLog::watching(&setup.publisher);
    let records = stream::iter(vec![
        log.deliver(0, Ok(transition(LeaseStatus::Active, LeaseStatus::FinanceLock))),
        log.deliver(1, Ok(transition(LeaseStatus::ResetLock, LeaseStatus::Active))),
    ]);

    let router = Arc::new(ChangeEventRouter::new(
        Arc::new(setup.store.clone()),
        Arc::new(setup.publisher.clone()),
        RouterTopics {
            locked: "lease-locked".to_string(),
            unlocked: "lease-unlocked".to_string(),
        },
        TransitionModel::FourState,
    ));
    app::change_feed_loop(router, records, 2, shutdown).await;

    assert_eq!(log.committed(), vec![(0, 2), (1, 2)]);
}

#[tokio::test]
async fn messages_not_yet_handled_at_shutdown_are_not_committed() {
    let setup = setup();
    setup
        .store
        .insert_lease(fixtures::lease("1", "alice", LeaseStatus::Active));
    let (shutdown_tx, shutdown) = watch::channel(false);
    let log = CommitLog::watching(&setup.publisher);
    let pipeline = TopicResetPipeline::new(Arc::new(setup.publisher.clone()), "account-reset-run");
    let consumer = Arc::new(ResetQueueConsumer::new(
        Arc::new(setup.store.clone()),
        Arc::new(pipeline),
    ));
    // The request is buffered but the loop is told to stop before handling it.
    let requests = stream::iter(vec![log.deliver(3, Ok("1".to_string()))]).chain(stream::pending());
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        app::reset_queue_loop(consumer, Box::pin(requests), 10, shutdown),
    )
    .await
    .expect("reset queue loop did not stop");

    assert!(log.committed().is_empty());
    assert_eq!(
        setup.store.lease("1", "alice").unwrap().status,
        LeaseStatus::Active
    );
}

#[tokio::test]
async fn sweep_once_enqueues_not_ready_accounts() {
    let setup = setup();
    setup
        .store
        .insert_account(fixtures::account("1", AccountStatus::NotReady));
    setup
        .store
        .insert_account(fixtures::account("2", AccountStatus::Ready));

    setup.worker.sweep_once().await;

    assert_eq!(setup.queue.enqueued(), vec!["1"]);
}

#[tokio::test]
async fn budget_checks_are_published_per_active_lease() {
    let setup = setup();
    setup
        .store
        .insert_lease(fixtures::lease("1", "alice", LeaseStatus::Active));
    setup
        .store
        .insert_lease(fixtures::lease("2", "bob", LeaseStatus::Inactive));

    setup.worker.check_budgets_once().await;

    let sent = setup.publisher.published_to("lease-budget-check");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body_json()["PrincipalId"], "alice");
}

#[tokio::test]
async fn sweep_loop_runs_immediately_and_stops_on_shutdown() {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::NotReady));
    let queue = InMemoryResetQueue::new();
    let dispatcher = Arc::new(ResetDispatcher::new(Arc::new(store), Arc::new(queue.clone())));
    let (shutdown_tx, shutdown) = watch::channel(false);

    let handle = tokio::spawn(app::sweep_loop(dispatcher, Duration::from_secs(3600), shutdown));
    for _ in 0..100 {
        if !queue.enqueued().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweep loop did not stop")
        .unwrap();
    assert_eq!(queue.enqueued(), vec!["1"]);
}

#[tokio::test]
async fn loops_stop_when_the_shutdown_sender_is_dropped() {
    let setup = setup();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let budget = Arc::new(BudgetCheckFanout::new(
        Arc::new(setup.store.clone()),
        Arc::new(RecordingBudgetChecker::new()),
    ));

    let handle = tokio::spawn(app::budget_loop(budget, Duration::from_secs(3600), shutdown));
    drop(shutdown_tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("budget loop did not stop")
        .unwrap();
}
