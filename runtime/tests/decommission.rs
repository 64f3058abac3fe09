//! Integration tests for lease decommissioning.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::Harness;
use lease_pool_core::model::{AccountStatus, LeaseStatus, LeaseStatusReason};
use lease_pool_core::state_store::StoreError;
use lease_pool_runtime::LeaseError;
use lease_pool_testing::fixtures;
use lease_pool_testing::StoreOperation;

const ACCOUNT: &str = "111111111111";

fn leased(harness: &Harness) {
    harness
        .store
        .insert_account(fixtures::account(ACCOUNT, AccountStatus::Leased));
    harness
        .store
        .insert_lease(fixtures::lease(ACCOUNT, "alice", LeaseStatus::Active));
}

#[tokio::test]
async fn decommission_releases_account_and_queues_reset() {
    let harness = Harness::new();
    leased(&harness);

    let lease = harness
        .provisioner()
        .decommission("alice", ACCOUNT, LeaseStatusReason::Expired)
        .await
        .unwrap();

    assert_eq!(lease.status, LeaseStatus::Inactive);
    assert_eq!(lease.status_reason, LeaseStatusReason::Expired);
    assert_eq!(
        harness.store.account(ACCOUNT).unwrap().status,
        AccountStatus::NotReady
    );
    assert_eq!(harness.queue.enqueued(), vec![ACCOUNT]);

    let deleted = harness.publisher.published_to("lease-deleted");
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].body_json()["LeaseStatus"], "Inactive");
    assert_eq!(deleted[0].body_json()["LeaseStatusReason"], "Expired");
}

#[tokio::test]
async fn missing_lease_is_not_found() {
    let harness = Harness::new();
    harness
        .store
        .insert_account(fixtures::account(ACCOUNT, AccountStatus::Leased));

    let err = harness
        .provisioner()
        .decommission("alice", ACCOUNT, LeaseStatusReason::Destroyed)
        .await
        .unwrap_err();

    assert!(matches!(err, LeaseError::NotFound { .. }));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn inactive_lease_is_rejected_without_mutation() {
    let harness = Harness::new();
    harness
        .store
        .insert_account(fixtures::account(ACCOUNT, AccountStatus::NotReady));
    harness
        .store
        .insert_lease(fixtures::lease(ACCOUNT, "alice", LeaseStatus::Inactive));

    let err = harness
        .provisioner()
        .decommission("alice", ACCOUNT, LeaseStatusReason::Destroyed)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LeaseError::LeaseNotActive {
            status: LeaseStatus::Inactive,
            ..
        }
    ));
    assert_eq!(harness.store.calls(StoreOperation::TransitionLeaseStatus), 0);
    assert!(harness.queue.enqueued().is_empty());
}

#[tokio::test]
async fn rollback_is_not_a_decommission_reason() {
    let harness = Harness::new();
    leased(&harness);

    let err = harness
        .provisioner()
        .decommission("alice", ACCOUNT, LeaseStatusReason::Rollback)
        .await
        .unwrap_err();

    assert!(matches!(err, LeaseError::Validation(_)));
    assert_eq!(
        harness.store.lease(ACCOUNT, "alice").unwrap().status,
        LeaseStatus::Active
    );
}

#[tokio::test]
async fn queue_and_publish_failures_do_not_fail_decommission() {
    let harness = Harness::new();
    leased(&harness);
    harness.queue.fail_for(ACCOUNT);
    harness.publisher.fail_topic("lease-deleted");

    let lease = harness
        .provisioner()
        .decommission("alice", ACCOUNT, LeaseStatusReason::OverBudget)
        .await
        .unwrap();

    assert_eq!(lease.status, LeaseStatus::Inactive);
    assert_eq!(
        harness.store.account(ACCOUNT).unwrap().status,
        AccountStatus::NotReady
    );
    assert!(harness.queue.enqueued().is_empty());
    assert!(harness.publisher.published().is_empty());
}

#[tokio::test]
async fn failed_account_release_stops_the_remaining_steps() {
    let harness = Harness::new();
    leased(&harness);
    harness.store.fail_next(
        StoreOperation::TransitionAccountStatus,
        StoreError::Storage("account table unavailable".into()),
    );

    let err = harness
        .provisioner()
        .decommission("alice", ACCOUNT, LeaseStatusReason::Destroyed)
        .await
        .unwrap_err();

    assert!(matches!(err, LeaseError::Store(StoreError::Storage(_))));
    // The lease transition already committed; the sweep never sees the account.
    assert_eq!(
        harness.store.lease(ACCOUNT, "alice").unwrap().status,
        LeaseStatus::Inactive
    );
    assert_eq!(
        harness.store.account(ACCOUNT).unwrap().status,
        AccountStatus::Leased
    );
    assert!(harness.queue.enqueued().is_empty());
    assert!(harness.publisher.published().is_empty());
}

#[tokio::test]
async fn concurrent_decommissions_have_one_winner() {
    let harness = Harness::new();
    leased(&harness);
    let provisioner = harness.provisioner();

    let (first, second) = tokio::join!(
        provisioner.decommission("alice", ACCOUNT, LeaseStatusReason::Expired),
        provisioner.decommission("alice", ACCOUNT, LeaseStatusReason::OverBudget),
    );

    assert_eq!(
        [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count(),
        1
    );
    assert_eq!(harness.queue.enqueued(), vec![ACCOUNT]);
}
