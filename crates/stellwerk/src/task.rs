use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Identifier of a submitted task.
///
/// Callers may supply their own id (any non-empty string) via
/// [`SubmitOptions::with_id`]; otherwise one is generated. Ids must be unique
/// among tasks that are currently live (queued or running); an id becomes
/// reusable once its task resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh id, unique for the process's lifetime.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// What went wrong with a task that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker process could not be created, or the job name is not
    /// registered.
    Spawn,
    /// Payload or result could not be carried across the process boundary.
    Serialization,
    /// The job ran and returned an error.
    Error,
    /// The job panicked inside the worker.
    Panic,
    /// The worker process died without reporting an outcome.
    Died,
    /// The task ran past its deadline and was killed.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Spawn => "spawn",
            FailureKind::Serialization => "serialization",
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Died => "died",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Failure descriptor delivered through a task's handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,

    /// Human-readable description (error display, panic message, exit status).
    pub message: String,

    /// Formatted detail when available: the job's error chain, the panic
    /// location and backtrace.
    pub trace: Option<String>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome kind without the payload, as carried by [`CompletionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Failed(FailureKind),
    Cancelled,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Completed => f.write_str("completed"),
            OutcomeKind::Failed(kind) => write!(f, "failed({kind})"),
            OutcomeKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Resolved state of a task, delivered exactly once per submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// The job returned a value.
    Completed(Value),
    /// The job, its worker, or its transport failed.
    Failed(TaskFailure),
    /// The task was cancelled (explicitly or during shutdown) before a real
    /// outcome was observed.
    Cancelled,
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Completed(_) => OutcomeKind::Completed,
            Outcome::Failed(failure) => OutcomeKind::Failed(failure.kind),
            Outcome::Cancelled => OutcomeKind::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The success value, if the task completed.
    pub fn completed(&self) -> Option<&Value> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// The failure descriptor, if the task failed.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Error detail for event records: failure display, or None.
    pub(crate) fn error_detail(&self) -> Option<String> {
        match self {
            Outcome::Failed(failure) => Some(failure.to_string()),
            _ => None,
        }
    }
}

/// Notification appended to the completion stream once per resolved task.
///
/// Events report the outcome *kind*; the success value itself travels only
/// through the task's handle. Events appear in finish order, not submission
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub id: TaskId,

    /// Name of the job the task ran.
    pub job: String,

    pub kind: OutcomeKind,

    /// Time from submission to resolution.
    pub duration: Duration,

    /// Wall-clock time the outcome was observed.
    pub finished_at: DateTime<Utc>,

    /// Failure description when `kind` is a failure.
    pub error: Option<String>,
}

/// Per-submission options for [`Runner::submit_with`](crate::Runner::submit_with).
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub(crate) id: Option<TaskId>,
    pub(crate) timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Kill the worker and resolve the task as a timeout failure if it runs
    /// longer than this.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A submitted unit of work, queued until the dispatcher picks it up.
///
/// The payload is encoded at submission; an encoding failure rides along and
/// resolves the handle as a serialization failure instead of failing
/// `submit` itself.
pub(crate) struct TaskRequest {
    pub(crate) id: TaskId,
    pub(crate) job: String,
    pub(crate) payload: Result<Value, serde_json::Error>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) submitted_at: Instant,
    pub(crate) resolver: oneshot::Sender<Outcome>,
}
