//! Integration tests for cancellation and per-task deadlines.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;

use stellwerk::{job_fn, FailureKind, JobRegistry, Runner, RunnerConfig, SubmitOptions};

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

/// Poll until `cond` holds; panics after `TIMEOUT`.
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn cancelling_a_queued_task_never_spawns_a_worker() {
    let runner = Runner::start(demo_registry(), demo_config().with_max_processes(1)).unwrap();

    let running = runner.submit("sleep_ms", &json!({ "ms": 2000 })).unwrap();
    {
        let runner = runner.clone();
        wait_for("first worker to spawn", move || runner.metrics().spawned == 1).await;
    }

    let queued = runner.submit("sleep_ms", &json!({ "ms": 2000 })).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    queued.cancel();
    let outcome = timeout(TIMEOUT, queued).await.expect("timed out");
    assert!(outcome.is_cancelled());
    assert_eq!(runner.metrics().spawned, 1, "queued task must not spawn");

    running.cancel();
    let outcome = timeout(TIMEOUT, running).await.expect("timed out");
    assert!(outcome.is_cancelled());

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn cancelling_a_running_task_kills_its_worker() {
    let runner = Runner::start(demo_registry(), demo_config()).unwrap();

    let handle = runner.submit("sleep_ms", &json!({ "ms": 60000 })).unwrap();
    {
        let runner = runner.clone();
        wait_for("worker to spawn", move || runner.metrics().spawned == 1).await;
    }

    handle.cancel();
    let outcome = timeout(TIMEOUT, handle).await.expect("timed out");
    assert!(outcome.is_cancelled());

    {
        let runner = runner.clone();
        wait_for("worker to be reaped", move || runner.metrics().running == 0).await;
    }
    assert_eq!(runner.metrics().cancelled, 1);
    assert_eq!(runner.live_tasks(), 0);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_after_resolution_changes_nothing() {
    let runner = Runner::start(demo_registry(), demo_config()).unwrap();
    let mut events = runner.completions();

    let payload = json!({ "k": "v" });
    let handle = runner.submit("echo", &payload).unwrap();

    // Wait until the task has resolved, then cancel through the handle.
    let _ = timeout(TIMEOUT, events.next()).await.expect("timed out");
    handle.cancel();

    let outcome = timeout(TIMEOUT, handle).await.expect("timed out");
    assert_eq!(outcome.completed(), Some(&payload));
    assert_eq!(runner.metrics().cancelled, 0);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn deadline_kills_the_worker_and_reports_timeout() {
    let runner = Runner::start(demo_registry(), demo_config()).unwrap();

    let started = Instant::now();
    let handle = runner
        .submit_with(
            "sleep_ms",
            &json!({ "ms": 60000 }),
            SubmitOptions::new().with_timeout(Duration::from_millis(300)),
        )
        .unwrap();

    let outcome = timeout(TIMEOUT, handle).await.expect("timed out");
    let failure = outcome.failure().expect("should fail");
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.message.contains("deadline"), "{failure}");
    assert!(started.elapsed() < Duration::from_secs(8), "deadline did not fire");

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn default_timeout_applies_when_the_task_sets_none() {
    let runner = Runner::start(
        demo_registry(),
        demo_config().with_default_timeout(Duration::from_millis(300)),
    )
    .unwrap();

    let outcome = timeout(
        TIMEOUT,
        runner.submit("sleep_ms", &json!({ "ms": 60000 })).unwrap(),
    )
    .await
    .expect("timed out");
    assert_eq!(outcome.failure().map(|f| f.kind), Some(FailureKind::Timeout));

    runner.stop().await.unwrap();
}
