//! E2E tests for fleet-wide mutual exclusion.
//!
//! Several scheduler replicas share one lock store. These tests verify that
//! a job runs on at most its permitted number of replicas at once.

use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;

use e2e_tests::{HoldingHandler, OverlapProbe, TestHarness};
use fleet_scheduler::{JobDefinition, Outcome, ScheduleSpec, SkipReason};

fn hourly() -> ScheduleSpec {
    ScheduleSpec::cron("0 * * * *").unwrap()
}

/// Register the same job on every replica, each backed by `probe`.
fn register_everywhere(
    harness: &TestHarness,
    name: &str,
    schedule: impl Fn() -> ScheduleSpec,
    probe: &std::sync::Arc<OverlapProbe>,
    hold: Duration,
    max_concurrency: usize,
) {
    for replica in &harness.replicas {
        let definition = JobDefinition::builder(
            name,
            schedule(),
            HoldingHandler::new(probe.clone(), hold),
        )
        .max_concurrency(max_concurrency)
        .lock_ttl(Duration::from_secs(5))
        .build()
        .unwrap();
        replica.register(definition).unwrap();
    }
}

/// E2E test: simultaneous manual triggers on five replicas have one winner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_triggers_single_winner() {
    let harness = TestHarness::new(5);
    let probe = OverlapProbe::new();
    register_everywhere(&harness, "invoice-run", hourly, &probe, Duration::from_millis(300), 1);

    let handles: Vec<_> = harness
        .replicas
        .iter()
        .map(|replica| replica.trigger_now("invoice-run").unwrap())
        .collect();
    let executions: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let successes = executions
        .iter()
        .filter(|e| e.outcome == Some(Outcome::Success))
        .count();
    let lost_race = executions
        .iter()
        .filter(|e| e.outcome == Some(Outcome::Skipped(SkipReason::LockHeldElsewhere)))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(lost_race, 4);
    assert_eq!(probe.runs(), 1);
    assert_eq!(probe.peak(), 1);

    // The winner released its lease
    assert!(harness.store.inner().is_empty());
}

/// E2E test: with a fleet-wide bound of two, a third replica is turned away.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fleet_wide_concurrency_bound() {
    let harness = TestHarness::new(3);
    let probe = OverlapProbe::new();
    register_everywhere(&harness, "reindex", hourly, &probe, Duration::from_millis(300), 2);

    let handles: Vec<_> = harness
        .replicas
        .iter()
        .map(|replica| replica.trigger_now("reindex").unwrap())
        .collect();
    let executions: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let mut outcomes: Vec<String> = executions
        .iter()
        .map(|e| format!("{:?}", e.outcome))
        .collect();
    outcomes.sort();
    assert_eq!(
        outcomes,
        vec![
            "Some(Skipped(LockHeldElsewhere))".to_string(),
            "Some(Success)".to_string(),
            "Some(Success)".to_string(),
        ]
    );
    assert_eq!(probe.peak(), 2);
    assert!(harness.store.inner().is_empty());
}

/// E2E test: two running replicas firing the same interval job never overlap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_never_overlap_on_schedule() {
    let harness = TestHarness::new(2);
    let probe = OverlapProbe::new();
    register_everywhere(
        &harness,
        "sweep",
        || ScheduleSpec::every(Duration::from_millis(100)).unwrap(),
        &probe,
        Duration::from_millis(60),
        1,
    );

    harness.start_all().await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    harness.shutdown_all().await;

    assert!(probe.runs() >= 3, "runs: {}", probe.runs());
    assert_eq!(probe.peak(), 1);
    assert_eq!(probe.active(), 0);
}

/// E2E test: a local-only job runs on every replica at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_only_job_runs_everywhere() {
    let harness = TestHarness::new(3);
    let probe = OverlapProbe::new();
    for replica in &harness.replicas {
        let definition = JobDefinition::builder(
            "cache-warm",
            hourly(),
            HoldingHandler::new(probe.clone(), Duration::from_millis(200)),
        )
        .local_only()
        .build()
        .unwrap();
        replica.register(definition).unwrap();
    }

    let handles: Vec<_> = harness
        .replicas
        .iter()
        .map(|replica| replica.trigger_now("cache-warm").unwrap())
        .collect();
    for execution in join_all(handles).await {
        assert_eq!(execution.unwrap().outcome, Some(Outcome::Success));
    }

    assert_eq!(probe.runs(), 3);
    assert_eq!(probe.peak(), 3);
}
