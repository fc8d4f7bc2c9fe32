//! Worker sweeps: leasing, retries, and backoff.

mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mise_db::models::PlanStatus;

use mise_core::config::EngineConfig;
use mise_core::publish::EventType;
use mise_core::worker::{SweepReport, Worker};
use mise_core::TaskFilter;

use common::{TestHarness, option_ids};

async fn voted_plan(h: &TestHarness) -> Uuid {
    let meal = h.simple_meal("Stew").await;
    let plan = h.plan(&[vec![meal, meal]]).await;
    let opts = option_ids(&plan, 0);
    h.vote(plan.id(), Uuid::new_v4(), &[(opts[0], 0), (opts[1], 1)])
        .await
        .unwrap();
    plan.id()
}

async fn status(h: &TestHarness, plan_id: Uuid) -> PlanStatus {
    h.engine.get_plan(plan_id, None).await.unwrap().plan.status
}

#[tokio::test]
async fn sweeps_finalize_then_materialize() {
    let h = TestHarness::new();
    let plan_id = voted_plan(&h).await;
    let worker = Worker::new(h.engine.clone());
    let cancel = CancellationToken::new();

    let early = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(early, SweepReport::default());

    h.pass_deadline();
    let (finalized, materialized) = worker.run_once(&cancel).await.unwrap();
    assert_eq!(finalized.due, 1);
    assert_eq!(finalized.processed, 1);
    assert_eq!(materialized.processed, 1);
    assert_eq!(status(&h, plan_id).await, PlanStatus::Finalized);

    let tasks = h.engine.list_tasks(plan_id, &TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 2);

    let lease = h.repo.lease(plan_id).expect("lease row");
    assert_eq!(lease.holder, None);
    assert_eq!(lease.attempts, 0);
    assert_eq!(lease.next_eligible_at, None);

    // Nothing left to do.
    let (again, again_tasks) = worker.run_once(&cancel).await.unwrap();
    assert_eq!(again.due, 0);
    assert_eq!(again_tasks.due, 0);
}

#[tokio::test]
async fn plan_leased_elsewhere_is_skipped_until_expiry() {
    let h = TestHarness::new();
    let plan_id = voted_plan(&h).await;
    h.pass_deadline();

    let ttl = Duration::seconds(60);
    let other = Uuid::new_v4();
    let lease = h
        .engine
        .repo()
        .acquire_lease(plan_id, other, h.engine.now(), ttl)
        .await
        .unwrap();
    assert!(lease.is_some());

    let worker = Worker::new(h.engine.clone());
    let cancel = CancellationToken::new();
    let report = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(status(&h, plan_id).await, PlanStatus::AwaitingVotes);

    h.clock.advance(ttl + Duration::seconds(1));
    let report = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(status(&h, plan_id).await, PlanStatus::Finalized);
}

#[tokio::test]
async fn two_workers_finalize_a_plan_once() {
    let h = TestHarness::new();
    let plan_id = voted_plan(&h).await;
    h.pass_deadline();

    let first = Worker::new(h.engine.clone());
    let second = Worker::new(h.engine.clone());
    assert_ne!(first.holder(), second.holder());
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        first.sweep_finalization(&cancel),
        second.sweep_finalization(&cancel)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.processed + b.processed, 1);
    assert_eq!(a.failed + b.failed, 0);
    assert_eq!(status(&h, plan_id).await, PlanStatus::Finalized);
    assert_eq!(
        h.published().await.events_of(EventType::MealPlanFinalized).len(),
        1
    );
}

#[tokio::test]
async fn transient_failures_are_retried_in_place() {
    let h = TestHarness::new();
    let plan_id = voted_plan(&h).await;
    h.pass_deadline();
    h.repo.fail_next_writes(2);

    let worker = Worker::new(h.engine.clone());
    let report = worker
        .sweep_finalization(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(status(&h, plan_id).await, PlanStatus::Finalized);
    assert!(
        h.published()
            .await
            .events_of(EventType::WorkerRetriesExhausted)
            .is_empty()
    );
}

#[tokio::test]
async fn exhausted_retries_back_off_and_alert() {
    let mut config = EngineConfig::default();
    config.worker.retry_base_delay_ms = 0;
    config.worker.max_attempts = 3;
    let h = TestHarness::with_config(config);
    let plan_id = voted_plan(&h).await;
    h.pass_deadline();
    h.repo.fail_next_writes(100);

    let worker = Worker::new(h.engine.clone());
    let cancel = CancellationToken::new();
    let report = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(status(&h, plan_id).await, PlanStatus::AwaitingVotes);

    let lease = h.repo.lease(plan_id).expect("lease row");
    assert_eq!(lease.holder, None);
    assert_eq!(lease.attempts, 1);
    assert_eq!(
        lease.next_eligible_at,
        Some(h.engine.now() + Duration::seconds(30))
    );

    let alerts = h.published().await.events_of(EventType::WorkerRetriesExhausted);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].entity_id, plan_id);
    assert_eq!(alerts[0].household_id, h.household);
    assert_eq!(alerts[0].metadata["attempts"], 3);

    // Fenced off until the backoff elapses.
    h.repo.fail_next_writes(0);
    let fenced = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(fenced.due, 0);

    h.clock.advance(Duration::seconds(31));
    let report = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(status(&h, plan_id).await, PlanStatus::Finalized);
    assert_eq!(h.repo.lease(plan_id).unwrap().attempts, 0);
}

#[tokio::test]
async fn cancelled_sweep_starts_no_plans() {
    let h = TestHarness::new();
    let plan_id = voted_plan(&h).await;
    h.pass_deadline();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let worker = Worker::new(h.engine.clone());
    let report = worker.sweep_finalization(&cancel).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(status(&h, plan_id).await, PlanStatus::AwaitingVotes);
}

#[tokio::test]
async fn run_loop_stops_on_cancel() {
    let h = TestHarness::new();
    let plan_id = voted_plan(&h).await;
    h.pass_deadline();

    let worker = Worker::new(h.engine.clone());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    // Both intervals tick immediately on start.
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("worker should stop")
        .expect("worker task should not panic")
        .unwrap();

    assert_eq!(status(&h, plan_id).await, PlanStatus::Finalized);
    assert!(h.engine.shutdown().await);
}
