//! Integration tests for the reset sweep and the reset-queue consumer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use lease_pool_core::model::{AccountStatus, LeaseStatus};
use lease_pool_core::state_store::StoreError;
use lease_pool_runtime::reset::{
    AccountSweepError, ResetDispatcher, ResetMessageError, ResetQueueConsumer, SweepError,
    SweepReport,
};
use lease_pool_testing::{
    InMemoryResetQueue, InMemoryStateStore, RecordingResetPipeline, StoreOperation, fixtures,
};
use std::sync::Arc;

fn dispatcher(store: &InMemoryStateStore, queue: &InMemoryResetQueue) -> ResetDispatcher {
    ResetDispatcher::new(Arc::new(store.clone()), Arc::new(queue.clone()))
}

fn consumer(store: &InMemoryStateStore, pipeline: &RecordingResetPipeline) -> ResetQueueConsumer {
    ResetQueueConsumer::new(Arc::new(store.clone()), Arc::new(pipeline.clone()))
}

// ============================================================================
// Sweep
// ============================================================================

#[tokio::test]
async fn sweep_enqueues_not_ready_accounts_and_clears_finance_locks() {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::NotReady));
    store.insert_account(fixtures::account("2", AccountStatus::Ready));
    store.insert_account(fixtures::account("3", AccountStatus::NotReady));
    store.insert_lease(fixtures::lease("3", "carol", LeaseStatus::FinanceLock));
    let queue = InMemoryResetQueue::new();

    let report = dispatcher(&store, &queue).sweep().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            accounts: 2,
            enqueued: 2,
            finance_locks_cleared: 1,
        }
    );
    assert_eq!(queue.enqueued(), vec!["1", "3"]);
    assert_eq!(
        store.lease("3", "carol").unwrap().status,
        LeaseStatus::Active
    );
}

#[tokio::test]
async fn sweep_continues_past_a_failed_enqueue() {
    let store = InMemoryStateStore::new();
    for id in ["1", "2", "3"] {
        store.insert_account(fixtures::account(id, AccountStatus::NotReady));
    }
    let queue = InMemoryResetQueue::new();
    queue.fail_for("2");

    let err = dispatcher(&store, &queue).sweep().await.unwrap_err();

    assert_eq!(queue.enqueued(), vec!["1", "3"]);
    let SweepError::Partial { report, errors } = err else {
        panic!("expected a partial sweep");
    };
    assert_eq!(report.enqueued, 2);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors.errors()[0], AccountSweepError::Enqueue(_)));
}

#[tokio::test]
async fn failed_finance_lock_still_counts_as_enqueued() {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::NotReady));
    store.insert_lease(fixtures::lease("1", "alice", LeaseStatus::FinanceLock));
    store.fail_next(
        StoreOperation::TransitionLeaseStatus,
        StoreError::Storage("throttled".into()),
    );
    let queue = InMemoryResetQueue::new();

    let err = dispatcher(&store, &queue).sweep().await.unwrap_err();

    let SweepError::Partial { report, errors } = err else {
        panic!("expected a partial sweep");
    };
    assert_eq!(report.enqueued, 1);
    assert_eq!(report.finance_locks_cleared, 0);
    assert!(matches!(
        errors.errors()[0],
        AccountSweepError::FinanceLock { .. }
    ));
    assert_eq!(queue.enqueued(), vec!["1"]);
}

#[tokio::test]
async fn sweep_fails_fast_when_listing_fails() {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::NotReady));
    store.fail_next(
        StoreOperation::FindAccountsByStatus,
        StoreError::Storage("scan failed".into()),
    );
    let queue = InMemoryResetQueue::new();

    let err = dispatcher(&store, &queue).sweep().await.unwrap_err();

    assert!(matches!(err, SweepError::List(_)));
    assert!(queue.enqueued().is_empty());
}

#[tokio::test]
async fn empty_sweep_reports_nothing() {
    let store = InMemoryStateStore::new();
    let queue = InMemoryResetQueue::new();

    let report = dispatcher(&store, &queue).sweep().await.unwrap();

    assert_eq!(report, SweepReport::default());
}

// ============================================================================
// Consumer
// ============================================================================

#[tokio::test]
async fn consumer_reset_locks_leases_and_starts_pipeline() {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::NotReady));
    store.insert_lease(fixtures::lease("1", "alice", LeaseStatus::Active));
    store.insert_lease(fixtures::lease("1", "bob", LeaseStatus::FinanceLock));
    store.insert_lease(fixtures::lease("1", "carol", LeaseStatus::Inactive));
    let pipeline = RecordingResetPipeline::new();

    let result = consumer(&store, &pipeline)
        .handle_message(" 1\n")
        .await
        .unwrap();

    assert_eq!(result.account_id, "1");
    assert_eq!(result.leases_locked, 2);
    assert_eq!(result.run_id, "reset-1-1");
    assert_eq!(pipeline.started(), vec!["1"]);
    assert_eq!(store.lease("1", "alice").unwrap().status, LeaseStatus::ResetLock);
    assert_eq!(
        store.lease("1", "bob").unwrap().status,
        LeaseStatus::ResetFinanceLock
    );
    assert_eq!(store.lease("1", "carol").unwrap().status, LeaseStatus::Inactive);
}

#[tokio::test]
async fn redelivered_message_starts_pipeline_again() {
    let store = InMemoryStateStore::new();
    store.insert_lease(fixtures::lease("1", "alice", LeaseStatus::Active));
    let pipeline = RecordingResetPipeline::new();
    let consumer = consumer(&store, &pipeline);

    let first = consumer.handle_message("1").await.unwrap();
    let second = consumer.handle_message("1").await.unwrap();

    assert_eq!(first.leases_locked, 1);
    assert_eq!(second.leases_locked, 0);
    assert_eq!(pipeline.started(), vec!["1", "1"]);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let store = InMemoryStateStore::new();
    let pipeline = RecordingResetPipeline::new();

    let err = consumer(&store, &pipeline)
        .handle_message("   ")
        .await
        .unwrap_err();

    assert_eq!(err, ResetMessageError::EmptyMessage);
    assert!(pipeline.started().is_empty());
}

#[tokio::test]
async fn batch_continues_past_failed_messages() {
    let store = InMemoryStateStore::new();
    let pipeline = RecordingResetPipeline::new();
    pipeline.fail_for("2");

    let err = consumer(&store, &pipeline)
        .handle_batch(["1", "2", "", "3"])
        .await
        .unwrap_err();

    assert_eq!(pipeline.started(), vec!["1", "3"]);
    assert_eq!(
        err.completed
            .iter()
            .map(|r| r.account_id.as_str())
            .collect::<Vec<_>>(),
        vec!["1", "3"]
    );
    assert_eq!(err.errors.len(), 2);
    assert!(matches!(
        err.errors.errors()[0],
        ResetMessageError::Pipeline { ref account_id, .. } if account_id == "2"
    ));
    assert_eq!(err.errors.errors()[1], ResetMessageError::EmptyMessage);
}

#[tokio::test]
async fn lock_failure_keeps_pipeline_from_starting() {
    let store = InMemoryStateStore::new();
    store.insert_lease(fixtures::lease("1", "alice", LeaseStatus::Active));
    store.fail_next(
        StoreOperation::TransitionLeaseStatus,
        StoreError::Storage("throttled".into()),
    );
    let pipeline = RecordingResetPipeline::new();

    let err = consumer(&store, &pipeline)
        .handle_message("1")
        .await
        .unwrap_err();

    assert!(matches!(err, ResetMessageError::Lock { .. }));
    assert!(pipeline.started().is_empty());
}
