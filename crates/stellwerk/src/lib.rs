//! Async task submission on top of a pool of single-use worker processes.
//!
//! Stellwerk pairs a tokio-side scheduler with OS processes: tasks are
//! submitted and awaited like futures, but each one executes a registered
//! [`Job`] in its own short-lived worker process. A counting semaphore keeps
//! at most `max_processes` workers alive at once; everything else waits in
//! submission order.
//!
//! # Architecture
//!
//! - **task**: ids, outcomes, failure taxonomy, completion events
//! - **registry**: the [`Job`] trait and the name-to-job table shared by
//!   host and workers
//! - **runner**: submission API, the coordinator loop, worker watchers
//! - **worker**: the re-executed child process side
//! - **handle**: per-task futures and the completion event stream
//! - **config**: runner settings, TOML loading, env overrides
//! - **metrics**: activity counters
//!
//! # Usage
//!
//! Workers are the host binary re-executed with a marker environment
//! variable, so [`worker::init`] must run before the async runtime starts:
//!
//! ```no_run
//! use serde_json::json;
//! use stellwerk::{job_fn, JobError, JobRegistry, Runner, RunnerConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut registry = JobRegistry::new();
//!     registry.register(job_fn("double", |input| async move {
//!         let n = input["n"].as_i64().unwrap_or(0);
//!         Ok::<_, JobError>(json!(n * 2))
//!     }))?;
//!
//!     // Worker processes take over here and never return.
//!     stellwerk::worker::init(&registry);
//!
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     runtime.block_on(async {
//!         let runner = Runner::start(registry, RunnerConfig::new().with_max_processes(4))?;
//!         let outcome = runner.submit("double", &json!({ "n": 21 }))?.await;
//!         println!("doubled: {:?}", outcome.completed());
//!         runner.stop().await?;
//!         anyhow::Ok(())
//!     })
//! }
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod metrics;
mod proto;
pub mod registry;
pub mod runner;
pub mod task;
pub mod worker;

pub use config::{RunnerConfig, WorkerCommand};
pub use error::{RunnerError, SubmitError};
pub use handle::{CompletionStream, StreamItem, TaskHandle};
pub use metrics::{MetricsSnapshot, RunnerMetrics};
pub use registry::{job_fn, EchoJob, FnJob, Job, JobError, JobRegistry, RegistryError};
pub use runner::Runner;
pub use task::{
    CompletionEvent, FailureKind, Outcome, OutcomeKind, SubmitOptions, TaskFailure, TaskId,
};
