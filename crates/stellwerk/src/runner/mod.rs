//! Task runner: async submission in front of a pool of worker processes.

mod coordinator;
mod watcher;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit};
use tracing::debug;

use crate::config::RunnerConfig;
use crate::error::{RunnerError, SubmitError};
use crate::handle::{CompletionStream, TaskHandle};
use crate::metrics::{MetricsSnapshot, RunnerMetrics};
use crate::registry::JobRegistry;
use crate::task::{Outcome, SubmitOptions, TaskId, TaskRequest};

use self::coordinator::Coordinator;

/// Messages feeding the coordinator's control channel.
#[derive(Debug)]
pub(crate) enum Control {
    /// Cancel one task, wherever it currently is.
    Cancel(TaskId),
    /// Begin shutdown; the sender fires once the drain finishes.
    Stop(oneshot::Sender<()>),
    /// The shutdown grace period ran out.
    GraceExpired,
    /// A watcher finished observing its worker.
    Done(Resolution),
}

/// What a watcher reports back for its task.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub(crate) id: TaskId,
    pub(crate) outcome: Outcome,
    /// The admission permit, returned to the pool after the outcome is
    /// recorded.
    pub(crate) permit: OwnedSemaphorePermit,
}

/// Hybrid scheduler: tasks are submitted and awaited on the async runtime,
/// executed in single-use worker processes, at most `max_processes` at once.
///
/// Cheap to clone; clones share the same coordinator. The runner stops when
/// [`Runner::stop`] is called or when every clone has been dropped and all
/// live tasks have resolved.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<RunnerShared>,
}

struct RunnerShared {
    queue_tx: mpsc::UnboundedSender<TaskRequest>,
    control_tx: mpsc::UnboundedSender<Control>,
    /// Master receiver, never read; `completions()` resubscribes from it.
    events_rx: Mutex<broadcast::Receiver<crate::task::CompletionEvent>>,
    /// Ids of tasks that are queued or running. Shared with the coordinator,
    /// which removes ids as tasks resolve.
    live: Arc<Mutex<HashSet<TaskId>>>,
    metrics: Arc<RunnerMetrics>,
    stopped: AtomicBool,
}

impl Runner {
    /// Start a runner over the given job registry.
    ///
    /// Fails if the configuration does not validate. The coordinator task is
    /// spawned onto the current runtime.
    pub fn start(registry: JobRegistry, config: RunnerConfig) -> Result<Runner, RunnerError> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = broadcast::channel(config.event_capacity);
        let live = Arc::new(Mutex::new(HashSet::new()));
        let metrics = Arc::new(RunnerMetrics::new());

        let coordinator = Coordinator::new(
            config,
            Arc::new(registry),
            queue_rx,
            control_rx,
            control_tx.clone(),
            events_tx,
            live.clone(),
            metrics.clone(),
        );
        tokio::spawn(coordinator.run());

        Ok(Runner {
            shared: Arc::new(RunnerShared {
                queue_tx,
                control_tx,
                events_rx: Mutex::new(events_rx),
                live,
                metrics,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Submit a task with a generated id and no per-task deadline.
    ///
    /// Returns synchronously once the task is queued; the returned handle
    /// resolves to the task's [`Outcome`]. The queue is unbounded: submission
    /// never applies back-pressure, so a producer that keeps outrunning the
    /// pool grows the queue without limit.
    pub fn submit<T>(
        &self,
        job: impl Into<String>,
        payload: &T,
    ) -> Result<TaskHandle, SubmitError>
    where
        T: Serialize + ?Sized,
    {
        self.submit_with(job, payload, SubmitOptions::new())
    }

    /// Submit a task with explicit [`SubmitOptions`].
    ///
    /// Fails synchronously only when the runner is stopped or the chosen id
    /// collides with a live task. A payload that fails to encode still
    /// submits; its handle resolves as a serialization failure.
    pub fn submit_with<T>(
        &self,
        job: impl Into<String>,
        payload: &T,
        options: SubmitOptions,
    ) -> Result<TaskHandle, SubmitError>
    where
        T: Serialize + ?Sized,
    {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(SubmitError::Stopped);
        }
        let job = job.into();
        let id = options.id.unwrap_or_else(TaskId::generate);

        {
            let mut live = self.shared.live.lock().unwrap();
            if !live.insert(id.clone()) {
                return Err(SubmitError::DuplicateId(id));
            }
        }

        let (resolver, rx) = oneshot::channel();
        let request = TaskRequest {
            id: id.clone(),
            job: job.clone(),
            payload: serde_json::to_value(payload),
            timeout: options.timeout,
            submitted_at: Instant::now(),
            resolver,
        };
        if self.shared.queue_tx.send(request).is_err() {
            // Coordinator is gone; undo the liveness claim.
            self.shared.live.lock().unwrap().remove(&id);
            return Err(SubmitError::Stopped);
        }
        self.shared.metrics.record_submitted();
        debug!(task = %id, job = %job, "task submitted");
        Ok(TaskHandle::new(id, job, rx, self.shared.control_tx.clone()))
    }

    /// Subscribe to completion notifications.
    ///
    /// Each subscriber gets every event published after it subscribed; a slow
    /// subscriber loses oldest events first and is told how many. The stream
    /// ends when the runner has stopped.
    pub fn completions(&self) -> CompletionStream {
        CompletionStream::new(self.shared.events_rx.lock().unwrap().resubscribe())
    }

    /// Number of tasks currently queued or running.
    pub fn live_tasks(&self) -> usize {
        self.shared.live.lock().unwrap().len()
    }

    /// Counters describing the runner's activity so far.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop the runner and resolve every live task.
    ///
    /// Queued tasks resolve as cancelled immediately. Running workers get
    /// `grace_period` to finish; stragglers are killed and resolve as
    /// cancelled. Returns once every task has resolved and the completion
    /// stream is closed. Idempotent.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.shared.control_tx.send(Control::Stop(ack_tx)).is_err() {
            // Already fully stopped.
            return Ok(());
        }
        match ack_rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(RunnerError::Terminated),
        }
    }
}
