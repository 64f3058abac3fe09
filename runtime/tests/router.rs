//! Integration tests for change-feed routing to lock/unlock topics.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use lease_pool_core::change_feed::{
    AttributeValue, ChangeEventKind, ChangeFeedError, ChangeRecord, LEASE_STATUS_ATTRIBUTE,
};
use lease_pool_core::model::{AccountStatus, LeaseStatus};
use lease_pool_runtime::router::{
    ChangeEventRouter, LockTopic, RouteError, RouteOutcome, RouterTopics, TransitionModel,
};
use lease_pool_core::state_store::StoreError;
use lease_pool_testing::{InMemoryStateStore, RecordingPublisher, StoreOperation, fixtures};
use std::sync::Arc;

const LOCKED: &str = "lease-locked";
const UNLOCKED: &str = "lease-unlocked";

fn router(model: TransitionModel) -> (ChangeEventRouter, RecordingPublisher) {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::Leased));
    router_over(store, model)
}

fn router_over(
    store: InMemoryStateStore,
    model: TransitionModel,
) -> (ChangeEventRouter, RecordingPublisher) {
    let publisher = RecordingPublisher::new();
    let router = ChangeEventRouter::new(
        Arc::new(store),
        Arc::new(publisher.clone()),
        RouterTopics {
            locked: LOCKED.to_string(),
            unlocked: UNLOCKED.to_string(),
        },
        model,
    );
    (router, publisher)
}

fn transition(prev: LeaseStatus, next: LeaseStatus) -> ChangeRecord {
    ChangeRecord::modify(
        &fixtures::lease("1", "alice", prev),
        &fixtures::lease("1", "alice", next),
    )
}

#[tokio::test]
async fn active_to_finance_lock_publishes_locked_snapshot() {
    let (router, publisher) = router(TransitionModel::FourState);

    let outcome = router
        .handle_record(&transition(LeaseStatus::Active, LeaseStatus::FinanceLock))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RouteOutcome::Published {
            topic: LockTopic::Locked,
            message_id: "msg-1".to_string(),
        }
    );
    let locked = publisher.published_to(LOCKED);
    assert_eq!(locked.len(), 1);
    let body = locked[0].body_json();
    assert_eq!(body["LeaseStatus"], "FinanceLock");
    assert_eq!(body["AccountId"], "1");
    assert_eq!(body["PrincipalId"], "alice");
}

#[tokio::test]
async fn account_read_failure_does_not_affect_routing() {
    let store = InMemoryStateStore::new();
    store.insert_account(fixtures::account("1", AccountStatus::Leased));
    store.fail_next(
        StoreOperation::GetAccount,
        StoreError::Storage("boom".to_string()),
    );
    let (router, publisher) = router_over(store, TransitionModel::FourState);

    let outcome = router
        .handle_record(&transition(LeaseStatus::Active, LeaseStatus::FinanceLock))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        RouteOutcome::Published {
            topic: LockTopic::Locked,
            ..
        }
    ));
    assert_eq!(publisher.published_to(LOCKED).len(), 1);
    assert!(publisher.published_to(UNLOCKED).is_empty());
}

#[tokio::test]
async fn reset_lock_to_active_publishes_unlocked() {
    let (router, publisher) = router(TransitionModel::FourState);

    router
        .handle_record(&transition(LeaseStatus::ResetLock, LeaseStatus::Active))
        .await
        .unwrap();

    assert_eq!(publisher.published_to(UNLOCKED).len(), 1);
    assert!(publisher.published_to(LOCKED).is_empty());
}

#[tokio::test]
async fn lock_to_lock_is_suppressed_under_four_state() {
    let (router, publisher) = router(TransitionModel::FourState);

    let outcome = router
        .handle_record(&transition(LeaseStatus::FinanceLock, LeaseStatus::ResetFinanceLock))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RouteOutcome::Suppressed {
            prev: LeaseStatus::FinanceLock,
            next: LeaseStatus::ResetFinanceLock,
        }
    );
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn two_state_unlocks_any_change_not_leaving_active() {
    let (router, publisher) = router(TransitionModel::TwoState);

    router
        .handle_record(&transition(LeaseStatus::FinanceLock, LeaseStatus::Inactive))
        .await
        .unwrap();
    router
        .handle_record(&transition(LeaseStatus::Active, LeaseStatus::Inactive))
        .await
        .unwrap();

    assert_eq!(publisher.published_to(UNLOCKED).len(), 1);
    assert_eq!(publisher.published_to(LOCKED).len(), 1);
}

#[tokio::test]
async fn unchanged_status_and_non_modify_records_are_skipped() {
    let (router, publisher) = router(TransitionModel::TwoState);

    let unchanged = router
        .handle_record(&transition(LeaseStatus::Active, LeaseStatus::Active))
        .await
        .unwrap();
    let mut insert = transition(LeaseStatus::Active, LeaseStatus::FinanceLock);
    insert.event_kind = ChangeEventKind::Insert;
    let ignored = router.handle_record(&insert).await.unwrap();

    assert_eq!(unchanged, RouteOutcome::Unchanged);
    assert_eq!(ignored, RouteOutcome::Ignored);
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn missing_status_is_a_decode_error() {
    let (router, publisher) = router(TransitionModel::FourState);
    let mut record = transition(LeaseStatus::Active, LeaseStatus::FinanceLock);
    record.before.remove(LEASE_STATUS_ATTRIBUTE);

    let err = router.handle_record(&record).await.unwrap_err();

    assert!(matches!(
        err,
        RouteError::Decode(ChangeFeedError::MissingAttribute { image: "before", .. })
    ));
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn unknown_status_is_a_decode_error() {
    let (router, _) = router(TransitionModel::FourState);
    let mut record = transition(LeaseStatus::Active, LeaseStatus::FinanceLock);
    record.after.insert(
        LEASE_STATUS_ATTRIBUTE.to_string(),
        AttributeValue::String("Frozen".to_string()),
    );

    let err = router.handle_record(&record).await.unwrap_err();

    assert!(matches!(
        err,
        RouteError::Decode(ChangeFeedError::InvalidAttribute { .. })
    ));
}

#[tokio::test]
async fn batch_publishes_what_it_can_and_aggregates_failures() {
    let (router, publisher) = router(TransitionModel::FourState);
    publisher.fail_next(1);
    let mut broken = transition(LeaseStatus::Active, LeaseStatus::ResetLock);
    broken.after.remove(LEASE_STATUS_ATTRIBUTE);

    let records = vec![
        transition(LeaseStatus::Active, LeaseStatus::FinanceLock),
        broken,
        transition(LeaseStatus::FinanceLock, LeaseStatus::Active),
    ];
    let err = router.handle_batch(&records).await.unwrap_err();

    assert_eq!(err.len(), 2);
    assert!(matches!(err.errors()[0], RouteError::Publish(_)));
    assert!(matches!(err.errors()[1], RouteError::Decode(_)));
    assert_eq!(publisher.published_to(UNLOCKED).len(), 1);
    assert!(publisher.published_to(LOCKED).is_empty());
}

#[tokio::test]
async fn record_decodes_from_feed_json() {
    let (router, publisher) = router(TransitionModel::FourState);
    let json = br#"{
        "eventKind": "MODIFY",
        "before": {
            "AccountId": {"S": "1"},
            "PrincipalId": {"S": "alice"},
            "LeaseStatus": {"S": "Active"}
        },
        "after": {
            "AccountId": {"S": "1"},
            "PrincipalId": {"S": "alice"},
            "LeaseStatus": {"S": "ResetLock"},
            "BudgetAmount": {"N": "250.5"},
            "BudgetNotificationEmails": {"SS": ["alice@example.com"]}
        }
    }"#;

    let record = ChangeRecord::from_json(json).unwrap();
    router.handle_record(&record).await.unwrap();

    let body = publisher.published_to(LOCKED)[0].body_json();
    assert_eq!(body["BudgetAmount"], 250.5);
    assert_eq!(body["BudgetNotificationEmails"][0], "alice@example.com");
}
