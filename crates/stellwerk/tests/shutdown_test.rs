//! Integration tests for stop(): draining, grace, force-kill.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;

use stellwerk::{job_fn, JobRegistry, OutcomeKind, Runner, RunnerConfig, StreamItem, SubmitError};

const TIMEOUT: Duration = Duration::from_secs(10);

fn demo_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    for name in ["echo", "sleep_ms"] {
        registry
            .register(job_fn(name, |input| async move { Ok(input) }))
            .unwrap();
    }
    registry
}

fn demo_config() -> RunnerConfig {
    RunnerConfig::new().with_worker_program(env!("CARGO_BIN_EXE_stellwerk-demo"))
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn stop_resolves_running_and_queued_tasks() {
    let runner = Runner::start(demo_registry(), demo_config().with_max_processes(2)).unwrap();
    let mut events = runner.completions();

    // Two run, three wait.
    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(runner.submit("sleep_ms", &json!({ "ms": 1200 })).unwrap());
    }
    {
        let runner = runner.clone();
        wait_for("two workers to spawn", move || runner.metrics().spawned == 2).await;
    }

    // Default grace is longer than the sleep, so the running pair finishes.
    timeout(TIMEOUT, runner.stop()).await.expect("stop timed out").unwrap();

    let mut completed = 0;
    let mut cancelled = 0;
    for handle in handles {
        match timeout(TIMEOUT, handle).await.expect("timed out").kind() {
            OutcomeKind::Completed => completed += 1,
            OutcomeKind::Cancelled => cancelled += 1,
            other => panic!("unexpected outcome: {other}"),
        }
    }
    assert_eq!(completed, 2, "the running tasks should finish inside grace");
    assert_eq!(cancelled, 3, "the queued tasks should cancel");

    // Five events, then the stream ends.
    let mut event_count = 0;
    loop {
        match timeout(TIMEOUT, events.next()).await.expect("timed out") {
            Some(StreamItem::Event(_)) => event_count += 1,
            Some(StreamItem::Lagged(n)) => event_count += n as usize,
            None => break,
        }
    }
    assert_eq!(event_count, 5);

    let snapshot = runner.metrics();
    assert_eq!(snapshot.resolved(), 5);
    assert_eq!(snapshot.running, 0);
    assert_eq!(runner.live_tasks(), 0);
}

#[tokio::test]
async fn stop_force_kills_workers_past_the_grace_period() {
    let runner = Runner::start(
        demo_registry(),
        demo_config().with_grace_period(Duration::from_millis(300)),
    )
    .unwrap();

    let handle = runner.submit("sleep_ms", &json!({ "ms": 60000 })).unwrap();
    {
        let runner = runner.clone();
        wait_for("worker to spawn", move || runner.metrics().spawned == 1).await;
    }

    let started = Instant::now();
    timeout(TIMEOUT, runner.stop()).await.expect("stop timed out").unwrap();
    let stopping_took = started.elapsed();

    let outcome = timeout(TIMEOUT, handle).await.expect("timed out");
    assert!(outcome.is_cancelled(), "force-killed task resolves as cancelled");
    assert!(
        stopping_took >= Duration::from_millis(290),
        "stop returned before the grace period: {stopping_took:?}"
    );
    assert!(
        stopping_took < Duration::from_secs(8),
        "stop waited for the full sleep: {stopping_took:?}"
    );
}

#[tokio::test]
async fn submissions_during_the_drain_are_rejected() {
    let runner = Runner::start(demo_registry(), demo_config().with_max_processes(1)).unwrap();

    let handle = runner.submit("sleep_ms", &json!({ "ms": 1500 })).unwrap();
    {
        let runner = runner.clone();
        wait_for("worker to spawn", move || runner.metrics().spawned == 1).await;
    }

    let stopper = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The drain is still waiting on the worker, but new work is refused.
    assert!(matches!(
        runner.submit("echo", &json!({})),
        Err(SubmitError::Stopped)
    ));

    timeout(TIMEOUT, stopper)
        .await
        .expect("stop timed out")
        .unwrap()
        .unwrap();
    let outcome = timeout(TIMEOUT, handle).await.expect("timed out");
    assert!(outcome.is_completed(), "running task finishes inside grace");
}

#[tokio::test]
async fn stop_with_nothing_live_returns_immediately() {
    let runner = Runner::start(demo_registry(), demo_config()).unwrap();

    let started = Instant::now();
    timeout(TIMEOUT, runner.stop()).await.expect("stop timed out").unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    // Still idempotent afterwards.
    timeout(TIMEOUT, runner.stop()).await.expect("stop timed out").unwrap();
}

#[tokio::test]
async fn concurrent_stops_on_clones_both_complete() {
    let runner = Runner::start(demo_registry(), demo_config()).unwrap();
    let peer = runner.clone();

    // Both requests land in the control channel before the drain finishes;
    // whichever the coordinator reads second must still be acknowledged.
    let (first, second) = timeout(TIMEOUT, async { tokio::join!(runner.stop(), peer.stop()) })
        .await
        .expect("stop timed out");
    first.expect("first stop failed");
    second.expect("second stop failed");
}
