//! The runner's control loop.
//!
//! One task owns every piece of mutable scheduling state: the submission
//! queue, the admission semaphore, the table of live tasks, and the
//! completion stream. Watchers and handles talk to it over the control
//! channel, so resolution is serialized and every task resolves exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::config::RunnerConfig;
use crate::metrics::RunnerMetrics;
use crate::proto::JobFrame;
use crate::registry::JobRegistry;
use crate::task::{CompletionEvent, FailureKind, Outcome, TaskFailure, TaskId, TaskRequest};

use super::{watcher, Control, Resolution};

pub(crate) struct Coordinator {
    config: RunnerConfig,
    registry: Arc<JobRegistry>,
    queue_rx: mpsc::UnboundedReceiver<TaskRequest>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// Cloned into each watcher so resolutions flow back to this loop.
    watcher_tx: mpsc::UnboundedSender<Control>,
    semaphore: Arc<Semaphore>,
    events: broadcast::Sender<CompletionEvent>,
    live: Arc<Mutex<HashSet<TaskId>>>,
    metrics: Arc<RunnerMetrics>,

    table: HashMap<TaskId, TaskEntry>,
    /// The dequeued task currently waiting for admission, if any. Its entry
    /// stays in `table` so cancellation can still reach it.
    head: Option<TaskId>,
    /// Cancels that arrived before their request; consumed on arrival.
    cancelled_ahead: HashSet<TaskId>,
    queue_open: bool,
    draining: bool,
    stop_acks: Vec<oneshot::Sender<()>>,
}

struct TaskEntry {
    job: String,
    submitted_at: Instant,
    resolver: oneshot::Sender<Outcome>,
    state: TaskState,
}

enum TaskState {
    Queued {
        payload: Result<Value, serde_json::Error>,
        timeout: Option<Duration>,
    },
    Running {
        /// Taken when a kill has been requested, so it fires at most once.
        kill: Option<oneshot::Sender<()>>,
    },
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: RunnerConfig,
        registry: Arc<JobRegistry>,
        queue_rx: mpsc::UnboundedReceiver<TaskRequest>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        watcher_tx: mpsc::UnboundedSender<Control>,
        events: broadcast::Sender<CompletionEvent>,
        live: Arc<Mutex<HashSet<TaskId>>>,
        metrics: Arc<RunnerMetrics>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_processes));
        Coordinator {
            config,
            registry,
            queue_rx,
            control_rx,
            watcher_tx,
            semaphore,
            events,
            live,
            metrics,
            table: HashMap::new(),
            head: None,
            cancelled_ahead: HashSet::new(),
            queue_open: true,
            draining: false,
            stop_acks: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(
            max_processes = self.config.max_processes,
            "coordinator started"
        );
        loop {
            tokio::select! {
                biased;

                Some(control) = self.control_rx.recv() => {
                    self.handle_control(control);
                }

                request = self.queue_rx.recv(), if self.queue_open && self.head.is_none() && !self.draining => {
                    match request {
                        Some(request) => self.admit_request(request),
                        // All runner clones dropped; no further submissions.
                        None => self.queue_open = false,
                    }
                }

                admitted = self.semaphore.clone().acquire_owned(), if self.head.is_some() => {
                    match admitted {
                        Ok(permit) => self.dispatch_head(permit),
                        Err(_) => error!("admission semaphore closed unexpectedly"),
                    }
                }
            }
            if self.should_exit() {
                break;
            }
        }
        // A concurrent stop can still be buffered when the loop exits. Close
        // the channel so later senders take the already-stopped path, then
        // pick up the acks in flight; any other late control message is
        // inert once the table is empty.
        self.control_rx.close();
        while let Ok(control) = self.control_rx.try_recv() {
            if let Control::Stop(ack) = control {
                self.stop_acks.push(ack);
            }
        }
        for ack in self.stop_acks.drain(..) {
            let _ = ack.send(());
        }
        // Dropping `self.events` here closes every completion stream.
        debug!("coordinator exited");
    }

    fn should_exit(&self) -> bool {
        if self.draining {
            self.table.is_empty()
        } else {
            !self.queue_open && self.head.is_none() && self.table.is_empty()
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Cancel(id) => self.handle_cancel(id),
            Control::Stop(ack) => self.handle_stop(ack),
            Control::GraceExpired => self.force_kill_running(),
            Control::Done(resolution) => self.handle_done(resolution),
        }
    }

    /// A freshly dequeued request becomes the head of the admission line.
    fn admit_request(&mut self, request: TaskRequest) {
        if self.cancelled_ahead.remove(&request.id) {
            debug!(task = %request.id, "request arrived already cancelled");
            let TaskRequest {
                id,
                job,
                submitted_at,
                resolver,
                ..
            } = request;
            self.resolve(&id, &job, submitted_at, resolver, Outcome::Cancelled);
            return;
        }
        let id = request.id.clone();
        self.table.insert(
            id.clone(),
            TaskEntry {
                job: request.job,
                submitted_at: request.submitted_at,
                resolver: request.resolver,
                state: TaskState::Queued {
                    payload: request.payload,
                    timeout: request.timeout,
                },
            },
        );
        self.head = Some(id);
    }

    /// An admission permit is in hand; turn the head task into a worker.
    fn dispatch_head(&mut self, permit: OwnedSemaphorePermit) {
        let Some(id) = self.head.take() else {
            return;
        };
        match self.table.remove(&id) {
            Some(TaskEntry {
                job,
                submitted_at,
                resolver,
                state: TaskState::Queued { payload, timeout },
            }) => {
                let payload = match payload {
                    Ok(value) => value,
                    Err(e) => {
                        self.resolve(
                            &id,
                            &job,
                            submitted_at,
                            resolver,
                            Outcome::Failed(TaskFailure::new(
                                FailureKind::Serialization,
                                format!("payload is not serializable: {e}"),
                            )),
                        );
                        drop(permit);
                        return;
                    }
                };
                if !self.registry.contains(&job) {
                    self.resolve(
                        &id,
                        &job,
                        submitted_at,
                        resolver,
                        Outcome::Failed(TaskFailure::new(
                            FailureKind::Spawn,
                            format!("no job named '{job}' is registered"),
                        )),
                    );
                    drop(permit);
                    return;
                }
                let frame = JobFrame {
                    id: id.clone(),
                    job: job.clone(),
                    payload,
                };
                let timeout = timeout.or(self.config.default_timeout);
                match watcher::launch(&self.config.worker, &id) {
                    Ok(child) => {
                        debug!(task = %id, job = %job, "worker spawned");
                        self.metrics.record_spawned();
                        let kill =
                            watcher::watch(child, frame, timeout, permit, self.watcher_tx.clone());
                        self.table.insert(
                            id,
                            TaskEntry {
                                job,
                                submitted_at,
                                resolver,
                                state: TaskState::Running { kill: Some(kill) },
                            },
                        );
                    }
                    Err(e) => {
                        warn!(task = %id, job = %job, error = %e, "failed to spawn worker");
                        self.resolve(
                            &id,
                            &job,
                            submitted_at,
                            resolver,
                            Outcome::Failed(TaskFailure::new(
                                FailureKind::Spawn,
                                format!("failed to spawn worker: {e}"),
                            )),
                        );
                        drop(permit);
                    }
                }
            }
            Some(entry) => {
                // Not in a queued state; put it back untouched.
                self.table.insert(id, entry);
            }
            None => {}
        }
    }

    fn handle_cancel(&mut self, id: TaskId) {
        let queued = match self.table.get_mut(&id) {
            None => {
                // Either already resolved, or the cancel outran its request.
                if self.live.lock().unwrap().contains(&id) {
                    debug!(task = %id, "cancel noted before the request arrived");
                    self.cancelled_ahead.insert(id);
                }
                return;
            }
            Some(entry) => match &mut entry.state {
                TaskState::Running { kill } => {
                    if let Some(kill) = kill.take() {
                        debug!(task = %id, "cancelling running worker");
                        let _ = kill.send(());
                    }
                    // Resolution arrives from the watcher once the worker dies.
                    false
                }
                TaskState::Queued { .. } => true,
            },
        };
        if queued {
            if self.head.as_ref() == Some(&id) {
                self.head = None;
            }
            if let Some(entry) = self.table.remove(&id) {
                debug!(task = %id, "cancelled while queued");
                self.resolve_entry(&id, entry, Outcome::Cancelled);
            }
        }
    }

    fn handle_stop(&mut self, ack: oneshot::Sender<()>) {
        self.stop_acks.push(ack);
        if self.draining {
            return;
        }
        self.draining = true;
        self.head = None;
        debug!("stop requested, draining");

        // Everything still waiting for admission resolves as cancelled.
        let queued: Vec<TaskId> = self
            .table
            .iter()
            .filter(|(_, entry)| matches!(entry.state, TaskState::Queued { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        for id in queued {
            if let Some(entry) = self.table.remove(&id) {
                self.resolve_entry(&id, entry, Outcome::Cancelled);
            }
        }

        // Flush requests the loop has not dequeued yet. Closing first means
        // anything a submitter managed to push is already buffered here.
        self.queue_rx.close();
        while let Ok(request) = self.queue_rx.try_recv() {
            let TaskRequest {
                id,
                job,
                submitted_at,
                resolver,
                ..
            } = request;
            self.resolve(&id, &job, submitted_at, resolver, Outcome::Cancelled);
        }
        self.cancelled_ahead.clear();

        if !self.table.is_empty() {
            let notify = self.watcher_tx.clone();
            let grace = self.config.grace_period;
            debug!(
                running = self.table.len(),
                grace_ms = grace.as_millis() as u64,
                "waiting for running workers"
            );
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = notify.send(Control::GraceExpired);
            });
        }
    }

    fn force_kill_running(&mut self) {
        let mut killed = 0usize;
        for (id, entry) in self.table.iter_mut() {
            if let TaskState::Running { kill } = &mut entry.state {
                if let Some(kill) = kill.take() {
                    debug!(task = %id, "force-killing worker past the grace period");
                    let _ = kill.send(());
                    killed += 1;
                }
            }
        }
        if killed > 0 {
            warn!(killed, "grace period expired with workers still running");
        }
    }

    fn handle_done(&mut self, resolution: Resolution) {
        let Resolution {
            id,
            outcome,
            permit,
        } = resolution;
        match self.table.remove(&id) {
            Some(entry) => {
                self.metrics.record_worker_gone();
                self.resolve_entry(&id, entry, outcome);
            }
            None => warn!(task = %id, "resolution for a task no longer tracked"),
        }
        // Returning the permit is what lets the next queued task dispatch.
        drop(permit);
    }

    fn resolve_entry(&mut self, id: &TaskId, entry: TaskEntry, outcome: Outcome) {
        let TaskEntry {
            job,
            submitted_at,
            resolver,
            ..
        } = entry;
        self.resolve(id, &job, submitted_at, resolver, outcome);
    }

    /// The single resolution point: settle the handle, free the id, count
    /// the outcome, publish the completion event.
    fn resolve(
        &mut self,
        id: &TaskId,
        job: &str,
        submitted_at: Instant,
        resolver: oneshot::Sender<Outcome>,
        outcome: Outcome,
    ) {
        let kind = outcome.kind();
        let error = outcome.error_detail();
        self.live.lock().unwrap().remove(id);
        self.metrics.record_outcome(kind);
        if resolver.send(outcome).is_err() {
            debug!(task = %id, "task handle dropped before resolution");
        }
        let event = CompletionEvent {
            id: id.clone(),
            job: job.to_string(),
            kind,
            duration: submitted_at.elapsed(),
            finished_at: Utc::now(),
            error,
        };
        let _ = self.events.send(event);
        debug!(task = %id, outcome = %kind, "task resolved");
    }
}
