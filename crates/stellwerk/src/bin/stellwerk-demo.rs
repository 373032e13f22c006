//! Demonstration binary: runs a batch of jobs through the process pool and
//! compares it against sequential execution, then walks through the failure
//! taxonomy.
//!
//! The same binary is the worker: re-executed children are claimed by
//! `worker::init` before anything else happens.

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use stellwerk::{
    job_fn, JobError, JobRegistry, Runner, RunnerConfig, StreamItem, SubmitOptions,
};

#[derive(Parser, Debug)]
#[command(name = "stellwerk-demo", about = "Process-pool task runner demo")]
struct DemoArgs {
    /// Number of tasks in the timing batch
    #[arg(long, default_value = "8")]
    tasks: usize,

    /// Worker process limit for the pooled run
    #[arg(long, default_value = "4")]
    max_processes: usize,

    /// Iterations per sum_squares task in the timing batch
    #[arg(long, default_value = "50000000")]
    n: u64,

    /// Path to a TOML config file (--max-processes still overrides it)
    #[arg(long)]
    config: Option<String>,

    /// Also run the failure showcase
    #[arg(long)]
    failures: bool,
}

const SUM_MODULUS: u64 = 1_000_000_007;

#[derive(Deserialize)]
struct SumArgs {
    n: u64,
}

#[derive(Deserialize)]
struct SleepArgs {
    ms: u64,
}

#[derive(Deserialize)]
struct ExitArgs {
    code: i32,
}

/// The demo job set. Integration tests lean on these names, so they cover
/// every way a task can end.
fn demo_registry() -> anyhow::Result<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register(stellwerk::EchoJob)?;
    registry.register(job_fn("sum_squares", |input| async move {
        let args: SumArgs =
            serde_json::from_value(input).map_err(|e| JobError::InvalidInput(e.to_string()))?;
        // Reduced mod a prime so any n stays inside u64 and JSON numbers.
        let mut sum: u64 = 0;
        for i in 0..args.n {
            let r = i % SUM_MODULUS;
            sum = (sum + r * r) % SUM_MODULUS;
        }
        Ok(json!({ "n": args.n, "sum": sum }))
    }))?;
    registry.register(job_fn("sleep_ms", |input| async move {
        let args: SleepArgs =
            serde_json::from_value(input).map_err(|e| JobError::InvalidInput(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(args.ms)).await;
        Ok(json!({ "slept_ms": args.ms }))
    }))?;
    registry.register(job_fn("fail_always", |_input| async move {
        Err::<serde_json::Value, _>(JobError::Failed("told to fail".to_string()))
    }))?;
    registry.register(job_fn("panic_boom", |_input| async move {
        panic!("boom")
    }))?;
    registry.register(job_fn("die_silently", |input| async move {
        let args: ExitArgs =
            serde_json::from_value(input).map_err(|e| JobError::InvalidInput(e.to_string()))?;
        // Leaves without an outcome frame; the host sees a dead worker.
        std::process::exit(args.code)
    }))?;
    registry.register(job_fn("stdout_junk", |input| async move {
        // Scribbles on the protocol channel before answering.
        println!("[stdout_junk] this line is not a frame");
        println!("neither is this one");
        Ok(input)
    }))?;
    Ok(registry)
}

fn main() -> anyhow::Result<()> {
    // Stdout belongs to the worker protocol; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = demo_registry()?;

    // Worker children diverge here and never come back.
    stellwerk::worker::init(&registry);

    let args = DemoArgs::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(args, registry))
}

async fn run(args: DemoArgs, registry: JobRegistry) -> anyhow::Result<()> {
    let base = match &args.config {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => RunnerConfig::new(),
    };

    println!(
        "timing {} sum_squares(n = {}) tasks: pool of {} vs one at a time",
        args.tasks, args.n, args.max_processes
    );

    let pooled_config = base.clone().with_max_processes(args.max_processes);
    let pooled = timed_batch(registry.clone(), pooled_config, args.tasks, args.n).await?;
    println!("  pooled     : {pooled:?}");

    let serial_config = base.clone().with_max_processes(1);
    let serial = timed_batch(registry.clone(), serial_config, args.tasks, args.n).await?;
    println!("  sequential : {serial:?}");
    println!(
        "  speedup    : {:.1}x",
        serial.as_secs_f64() / pooled.as_secs_f64().max(f64::EPSILON)
    );

    if args.failures {
        failure_showcase(registry, base).await?;
    }
    Ok(())
}

/// Submit the whole batch at once and wait for every task.
async fn timed_batch(
    registry: JobRegistry,
    config: RunnerConfig,
    tasks: usize,
    n: u64,
) -> anyhow::Result<Duration> {
    let runner = Runner::start(registry, config)?;
    let mut events = runner.completions();
    let drain = tokio::spawn(async move {
        let mut seen = 0usize;
        while let Some(item) = events.next().await {
            if let StreamItem::Event(event) = item {
                info!(task = %event.id, job = %event.job, outcome = %event.kind, "event");
                seen += 1;
            }
        }
        seen
    });

    let started = Instant::now();
    let mut handles = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        handles.push(runner.submit("sum_squares", &json!({ "n": n }))?);
    }
    for handle in handles {
        let outcome = handle.await;
        anyhow::ensure!(
            outcome.is_completed(),
            "batch task did not complete: {outcome:?}"
        );
    }
    let elapsed = started.elapsed();

    let snapshot = runner.metrics();
    runner.stop().await?;
    let seen = drain.await.context("event drain task failed")?;
    info!(
        submitted = snapshot.submitted,
        resolved = snapshot.resolved(),
        peak_running = snapshot.peak_running,
        events = seen,
        "batch finished"
    );
    Ok(elapsed)
}

/// One of each way a task can end.
async fn failure_showcase(registry: JobRegistry, base: RunnerConfig) -> anyhow::Result<()> {
    println!("failure showcase:");
    let runner = Runner::start(registry, base.with_max_processes(2))?;

    let cases = vec![
        ("echo", json!({ "msg": "plain success" }), None),
        ("fail_always", json!({}), None),
        ("panic_boom", json!({}), None),
        ("die_silently", json!({ "code": 3 }), None),
        ("stdout_junk", json!({ "still": "works" }), None),
        ("not_registered", json!({}), None),
        (
            "sleep_ms",
            json!({ "ms": 60_000 }),
            Some(Duration::from_millis(250)),
        ),
    ];

    for (job, payload, timeout) in cases {
        let mut options = SubmitOptions::new();
        if let Some(timeout) = timeout {
            options = options.with_timeout(timeout);
        }
        let outcome = runner.submit_with(job, &payload, options)?.await;
        match outcome.failure() {
            Some(failure) => println!("  {job:<16} -> {failure}"),
            None => println!("  {job:<16} -> {}", outcome.kind()),
        }
    }

    let snapshot = runner.metrics();
    runner.stop().await?;
    println!(
        "  counters: {} submitted, {} completed, {} failed, {} cancelled",
        snapshot.submitted, snapshot.completed, snapshot.failed, snapshot.cancelled
    );
    Ok(())
}
