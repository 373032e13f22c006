//! Per-worker process management.
//!
//! The coordinator spawns one child per dispatched task and hands it to a
//! watcher task. The watcher feeds the job frame, then waits for whichever
//! comes first: an outcome frame, end-of-file (the worker died), a kill
//! request, or the task deadline. Exactly one [`Resolution`] comes back per
//! worker, carrying the admission permit home.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tracing::{debug, warn};

use crate::config::WorkerCommand;
use crate::proto::{self, JobFrame, TASK_ENV_VAR, WORKER_ENV_VAR};
use crate::task::{FailureKind, Outcome, TaskFailure, TaskId};

use super::{Control, Resolution};

/// How long a worker may linger after its fate is decided before SIGKILL.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Spawn the worker process for one task.
pub(crate) fn launch(command: &WorkerCommand, id: &TaskId) -> std::io::Result<Child> {
    let program = match &command.program {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    Command::new(&program)
        .args(&command.args)
        .env(WORKER_ENV_VAR, "1")
        .env(TASK_ENV_VAR, id.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
}

/// Start the watcher task for a spawned worker.
///
/// Returns the kill trigger; sending on it terminates the worker and
/// resolves the task as cancelled (unless the real outcome wins the race).
pub(crate) fn watch(
    child: Child,
    frame: JobFrame,
    timeout: Option<Duration>,
    permit: OwnedSemaphorePermit,
    control: mpsc::UnboundedSender<Control>,
) -> oneshot::Sender<()> {
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(async move {
        let id = frame.id.clone();
        let outcome = observe(child, frame, timeout, kill_rx).await;
        let _ = control.send(Control::Done(Resolution {
            id,
            outcome,
            permit,
        }));
    });
    kill_tx
}

/// Drive one worker to a single outcome.
async fn observe(
    mut child: Child,
    frame: JobFrame,
    timeout: Option<Duration>,
    mut kill_rx: oneshot::Receiver<()>,
) -> Outcome {
    let id = frame.id.clone();

    let Some(mut stdin) = child.stdin.take() else {
        let _ = kill_and_reap(&mut child).await;
        return Outcome::Failed(TaskFailure::new(
            FailureKind::Spawn,
            "worker stdin unavailable",
        ));
    };
    let Some(stdout) = child.stdout.take() else {
        let _ = kill_and_reap(&mut child).await;
        return Outcome::Failed(TaskFailure::new(
            FailureKind::Spawn,
            "worker stdout unavailable",
        ));
    };

    // One frame out; closing stdin afterwards gives the worker clean EOF.
    let written = proto::write_frame(&mut stdin, &frame).await;
    drop(stdin);
    if let Err(e) = written {
        warn!(task = %id, error = %e, "failed to write job frame to worker");
        let status = kill_and_reap(&mut child).await;
        return died(status, format!("worker rejected its job frame: {e}"));
    }

    let mut reader = BufReader::new(stdout);

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    tokio::select! {
        read = proto::read_outcome(&mut reader) => match read {
            Ok(Some(outcome_frame)) => {
                let _ = reap(&mut child).await;
                debug!(task = %id, "worker reported an outcome");
                outcome_frame.into_outcome()
            }
            Ok(None) => {
                let status = reap(&mut child).await;
                warn!(task = %id, "worker exited without reporting");
                died(status, "worker exited without reporting an outcome".to_string())
            }
            Err(e) => {
                let status = kill_and_reap(&mut child).await;
                died(status, format!("failed to read worker stdout: {e}"))
            }
        },
        _ = &mut kill_rx => {
            debug!(task = %id, "killing worker on request");
            let _ = kill_and_reap(&mut child).await;
            Outcome::Cancelled
        }
        _ = &mut deadline => {
            let limit = timeout.unwrap_or_default();
            warn!(task = %id, ?limit, "task deadline exceeded, killing worker");
            let _ = kill_and_reap(&mut child).await;
            Outcome::Failed(TaskFailure::new(
                FailureKind::Timeout,
                format!("task ran past its {limit:?} deadline"),
            ))
        }
    }
}

async fn kill_and_reap(child: &mut Child) -> Option<std::process::ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill failed (worker already gone?)");
    }
    reap(child).await
}

/// Collect the exit status, with a kill fallback so a lingering child cannot
/// leak the watcher.
async fn reap(child: &mut Child) -> Option<std::process::ExitStatus> {
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for worker");
            None
        }
        Err(_) => {
            warn!("worker did not exit in time, killing");
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

fn died(status: Option<std::process::ExitStatus>, context: String) -> Outcome {
    let message = match status {
        Some(status) => format!("{context} ({status})"),
        None => context,
    };
    Outcome::Failed(TaskFailure::new(FailureKind::Died, message))
}
