//! End-to-end coordination scenarios through the library API.
//!
//! Time is driven by a `ManualClock`; nothing here sleeps on the wall clock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use neona::audit::{Decision, DecisionPoint, TransitionCause};
use neona::clock::ManualClock;
use neona::error::CoordinationError;
use neona::policy::{PolicyDocument, PolicyEngine, PolicyScope, UpdateMode};
use neona::store::Store;
use neona::store::rows::truncate_ts;
use neona::tasks::reaper::run_reaper_cycle;
use neona::tasks::{Evidence, NewTask, RetryPolicy, TaskManager, TaskStatus, TestResults};

async fn manager_on(store: Store, policy: PolicyEngine) -> (Arc<TaskManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(truncate_ts(Utc::now())));
    let manager = TaskManager::new(Arc::new(store), Arc::new(policy), clock.clone())
        .with_retry(RetryPolicy::default().deterministic(), 3);
    (Arc::new(manager), clock)
}

async fn manager() -> (Arc<TaskManager>, Arc<ManualClock>) {
    manager_on(Store::new_memory().await.unwrap(), PolicyEngine::default()).await
}

fn diff_evidence() -> Evidence {
    Evidence {
        diff_refs: vec!["4f2a9c1".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let (manager, _) = manager().await;
    let task = manager
        .create_task(NewTask::new("contended").lock_path("src/**"))
        .await
        .unwrap();

    let task_id = task.id;
    let attempts = (0..8).map(|i| {
        let manager = Arc::clone(&manager);
        let worker = format!("worker-{i}");
        tokio::spawn(async move { manager.claim(task_id, &worker, None).await })
    });
    let results = futures::future::join_all(attempts).await;

    let mut winners = Vec::new();
    for result in results {
        match result.unwrap() {
            Ok(claimed) => winners.push(claimed.claimed_by.unwrap()),
            Err(CoordinationError::LockConflict { .. }) => {}
            Err(other) => panic!("unexpected claim error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = manager.get_task(task.id).await.unwrap();
    assert_eq!(stored.claimed_by.as_deref(), Some(winners[0].as_str()));
    // One ALLOW for the winner; losers never reached the policy check.
    assert_eq!(manager.decisions(task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn overlapping_path_globs_exclude_each_other() {
    let (manager, _) = manager().await;
    let broad = manager
        .create_task(NewTask::new("refactor").lock_path("src/**"))
        .await
        .unwrap();
    let narrow = manager
        .create_task(NewTask::new("api tweak").lock_path("src/api/*.rs"))
        .await
        .unwrap();

    manager.claim(broad.id, "w1", None).await.unwrap();
    // Holding the broad lock does not let the same worker take an overlapping one.
    for worker in ["w1", "w2"] {
        let err = manager.claim(narrow.id, worker, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::LockConflict { ref holder, .. } if holder == "w1"));
    }

    let untouched = manager.get_task(narrow.id).await.unwrap();
    assert_eq!(untouched.status, TaskStatus::Queued);
    assert!(untouched.claimed_by.is_none());
    assert!(manager.decisions(narrow.id).await.unwrap().is_empty());
    assert_eq!(manager.transitions(narrow.id).await.unwrap().len(), 1);
    assert!(manager.live_locks().await.unwrap().iter().all(|l| l.task_id == broad.id));

    manager.release(broad.id, "w1").await.unwrap();
    let claimed = manager.claim(narrow.id, "w2", None).await.unwrap();
    assert_eq!(claimed.claimed_by.as_deref(), Some("w2"));
    assert_eq!(manager.decisions(narrow.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn workflow_runs_in_dependency_order() {
    let (manager, _) = manager().await;
    let (design, build, test, ship) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    manager
        .create_batch(vec![
            NewTask::new("ship").with_id(ship).depends_on(build).depends_on(test),
            NewTask::new("test").with_id(test).depends_on(design),
            NewTask::new("build").with_id(build).depends_on(design),
            NewTask::new("design").with_id(design),
        ])
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(next) = manager.next_task().await.unwrap() {
        manager.claim(next.id, "w1", None).await.unwrap();
        manager.start(next.id, "w1").await.unwrap();
        manager.complete(next.id, "w1", diff_evidence()).await.unwrap();
        order.push(next.id);
    }

    assert_eq!(order.len(), 4);
    assert_eq!(order[0], design);
    assert_eq!(order[3], ship);
    for task in manager.list_tasks(None).await.unwrap() {
        assert_eq!(task.status, TaskStatus::Done);
    }
}

#[tokio::test]
async fn reaper_cycle_requeues_and_promotes() {
    let (manager, clock) = manager().await;
    let lapsed = manager.create_task(NewTask::new("lapsed")).await.unwrap();
    let flaky = manager.create_task(NewTask::new("flaky")).await.unwrap();

    manager.claim(lapsed.id, "w1", Some(10)).await.unwrap();
    manager.claim(flaky.id, "w2", Some(600)).await.unwrap();
    manager.start(flaky.id, "w2").await.unwrap();
    let failed = manager.fail(flaky.id, "w2", "tests crashed").await.unwrap();
    let retry_at = failed.retry_at.unwrap();

    clock.advance(Duration::seconds(11));
    assert!(manager.now() > retry_at);
    run_reaper_cycle(&manager).await.unwrap();

    let lapsed = manager.get_task(lapsed.id).await.unwrap();
    assert_eq!(lapsed.status, TaskStatus::Queued);
    assert!(lapsed.claimed_by.is_none());
    let expiry = manager.transitions(lapsed.id).await.unwrap();
    let last = expiry.last().unwrap();
    assert_eq!(last.cause, TransitionCause::LeaseExpired);
    assert_eq!(last.actor, "w1");

    let flaky = manager.get_task(flaky.id).await.unwrap();
    assert_eq!(flaky.status, TaskStatus::Queued);
    assert_eq!(flaky.attempts, 1);
}

#[tokio::test]
async fn every_evaluation_leaves_one_record() {
    let (manager, _) = manager().await;
    manager
        .policy()
        .update(
            PolicyScope::Global,
            PolicyDocument::from_json(r#"{"evidenceRequired": "tests"}"#).unwrap(),
            UpdateMode::Merge,
        )
        .unwrap();
    let t = manager.create_task(NewTask::new("t")).await.unwrap();

    manager.claim(t.id, "w1", None).await.unwrap();
    manager.start(t.id, "w1").await.unwrap();
    let err = manager
        .complete(
            t.id,
            "w1",
            Evidence {
                test_results: Some(TestResults { passed: 3, failed: 1 }),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::EvidenceInvalid { .. }));

    manager.retry(t.id).await.unwrap();
    manager.claim(t.id, "w1", None).await.unwrap();
    manager.start(t.id, "w1").await.unwrap();
    manager
        .complete(
            t.id,
            "w1",
            Evidence {
                test_results: Some(TestResults { passed: 4, failed: 0 }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let decisions = manager.decisions(t.id).await.unwrap();
    let summary: Vec<_> = decisions.iter().map(|d| (d.point, d.decision)).collect();
    assert_eq!(
        summary,
        vec![
            (DecisionPoint::PreClaim, Decision::Allow),
            (DecisionPoint::PostCompletion, Decision::Reject),
            (DecisionPoint::PreClaim, Decision::Allow),
            (DecisionPoint::PostCompletion, Decision::Approve),
        ]
    );
    assert_eq!(err.decision_id(), Some(decisions[1].id));
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("neona.db");

    let id = {
        let store = Store::new_local(&path).await.unwrap();
        let (manager, _) = manager_on(store, PolicyEngine::default()).await;
        let t = manager.create_task(NewTask::new("durable").lock_path("docs/**")).await.unwrap();
        manager.claim(t.id, "w1", Some(600)).await.unwrap();
        t.id
    };

    let store = Store::new_local(&path).await.unwrap();
    let (manager, _) = manager_on(store, PolicyEngine::default()).await;
    let task = manager.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.lock_paths, vec!["docs/**".to_string()]);
    assert_eq!(manager.decisions(id).await.unwrap().len(), 1);
    assert_eq!(manager.transitions(id).await.unwrap().len(), 2);
}
