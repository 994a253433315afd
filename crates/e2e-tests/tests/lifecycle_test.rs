//! E2E tests for scheduler lifecycle across replicas.
//!
//! Covers graceful shutdown of in-flight work, one-shot retirement, pause,
//! and a monitoring subscriber that never reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use e2e_tests::{wait_until, HoldingHandler, OverlapProbe, TestHarness};
use fleet_scheduler::{
    handler_fn, HandlerError, JobContext, JobDefinition, ScheduleSpec, SchedulerError,
};

/// E2E test: shutdown cancels in-flight handlers and waits for them.
#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_cancels_in_flight_handlers() {
    let harness = TestHarness::new(2);
    let observed = Arc::new(AtomicBool::new(false));

    for (i, replica) in harness.replicas.iter().enumerate() {
        let observed = observed.clone();
        let definition = JobDefinition::builder(
            format!("drain-{}", i),
            ScheduleSpec::cron("0 * * * *").unwrap(),
            handler_fn(move |ctx: JobContext| {
                let observed = observed.clone();
                async move {
                    ctx.cancelled().await;
                    observed.store(true, Ordering::SeqCst);
                    Err(HandlerError::retryable("interrupted"))
                }
            }),
        )
        .build()
        .unwrap();
        replica.register(definition).unwrap();
    }
    harness.start_all().await;

    let running = harness.replica(0).trigger_now("drain-0").unwrap();
    let scheduler = harness.replica(0).clone();
    assert!(wait_until(Duration::from_secs(2), || scheduler.in_flight() == 1).await);

    let started = Instant::now();
    harness.shutdown_all().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let execution = running.await.unwrap();
    assert_eq!(execution.attempt, 1);
    assert!(observed.load(Ordering::SeqCst));
    assert_eq!(harness.replica(0).in_flight(), 0);
    assert!(harness.store.inner().is_empty());

    // Stopped replicas refuse new work
    assert!(matches!(
        harness.replica(1).trigger_now("drain-1"),
        Err(SchedulerError::ShutDown)
    ));
}

/// E2E test: a delayed one-shot fires once on one replica and is retired.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_shot_fires_once_across_fleet() {
    let harness = TestHarness::new(3);
    let probe = OverlapProbe::new();
    for replica in &harness.replicas {
        let definition = JobDefinition::builder(
            "migrate-once",
            ScheduleSpec::delay(Duration::from_millis(150)).unwrap(),
            HoldingHandler::new(probe.clone(), Duration::from_millis(200)),
        )
        .build()
        .unwrap();
        replica.register(definition).unwrap();
    }
    harness.start_all().await;

    let replicas = harness.replicas.clone();
    let retired = wait_until(Duration::from_secs(3), || {
        replicas
            .iter()
            .all(|replica| replica.registry().get("migrate-once").is_none())
    })
    .await;
    harness.shutdown_all().await;

    assert!(retired);
    assert_eq!(probe.runs(), 1);
}

/// E2E test: pausing on one replica lets the others keep the job going.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paused_replica_defers_to_fleet() {
    let harness = TestHarness::new(2);
    let probe_paused = OverlapProbe::new();
    let probe_active = OverlapProbe::new();

    for (replica, probe) in harness
        .replicas
        .iter()
        .zip([probe_paused.clone(), probe_active.clone()])
    {
        let definition = JobDefinition::builder(
            "heartbeat",
            ScheduleSpec::every(Duration::from_millis(100)).unwrap(),
            HoldingHandler::new(probe, Duration::from_millis(5)),
        )
        .build()
        .unwrap();
        replica.register(definition).unwrap();
    }
    harness.replica(0).pause_job("heartbeat").unwrap();
    harness.start_all().await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    harness.shutdown_all().await;

    assert_eq!(probe_paused.runs(), 0);
    assert!(probe_active.runs() >= 2, "runs: {}", probe_active.runs());
    assert!(
        harness
            .replica(0)
            .registry()
            .get_status("heartbeat")
            .unwrap()
            .is_paused
    );
}

/// E2E test: a subscriber that never reads does not hold jobs back.
#[tokio::test(flavor = "multi_thread")]
async fn test_idle_subscriber_does_not_block_jobs() {
    let harness = TestHarness::new(1);
    let scheduler = harness.replica(0);
    let probe = OverlapProbe::new();
    scheduler
        .register(
            JobDefinition::builder(
                "burst",
                ScheduleSpec::cron("0 * * * *").unwrap(),
                HoldingHandler::new(probe.clone(), Duration::ZERO),
            )
            .build()
            .unwrap(),
        )
        .unwrap();

    let _idle = scheduler.subscribe();
    let capacity = scheduler.config().monitor_capacity;
    for _ in 0..capacity + 10 {
        scheduler.trigger_now("burst").unwrap().await.unwrap();
    }

    assert_eq!(probe.runs(), capacity + 10);
}
