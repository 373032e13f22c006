//! Worker-mode entry point.
//!
//! A runner spawns workers by re-running the host executable (or a configured
//! program) with the worker environment marker set. Hosts call [`init`] first
//! thing in `main`, before starting their own async runtime: with the marker
//! absent the call returns immediately; with it set the process becomes a
//! worker, serves exactly one task, and exits.
//!
//! The worker owns the process's stdout for its one outcome frame. Job code
//! should log through `tracing` or stderr; raw stdout writes are tolerated by
//! the parent's frame scan but remain bad manners.

use std::any::Any;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::proto::{self, JobFrame, OutcomeFrame, WireErrorKind, WORKER_ENV_VAR};
use crate::registry::{JobError, JobRegistry};

/// Divert into worker mode when spawned as a worker; no-op otherwise.
///
/// Must run before the host builds its own tokio runtime, because worker mode
/// builds a fresh single-threaded runtime for the job. Does not return in
/// worker mode: the process exits 0 once an outcome frame is written (a job
/// failure is still a written frame) and 1 on protocol breakdown.
pub fn init(registry: &JobRegistry) {
    if std::env::var_os(WORKER_ENV_VAR).is_none() {
        return;
    }
    std::process::exit(run(registry));
}

fn run(registry: &JobRegistry) -> i32 {
    let mut line = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
        eprintln!("stellwerk worker: failed to read job frame: {e}");
        return 1;
    }
    if line.trim().is_empty() {
        // Parent went away before writing the frame.
        eprintln!("stellwerk worker: no job frame on stdin");
        return 1;
    }

    let frame: JobFrame = match proto::decode_line(&line) {
        Ok(frame) => frame,
        Err(e) => {
            return respond(&OutcomeFrame::err(
                WireErrorKind::Payload,
                format!("unparseable job frame: {e}"),
            ));
        }
    };

    let span = tracing::info_span!("worker", task = %frame.id, job = %frame.job);
    let _guard = span.enter();
    debug!("running job");

    let outcome = execute(registry, frame);
    respond(&outcome)
}

/// Resolve and run the job, converting every failure mode into a frame.
fn execute(registry: &JobRegistry, frame: JobFrame) -> OutcomeFrame {
    let Some(job) = registry.get(&frame.job) else {
        return OutcomeFrame::err(
            WireErrorKind::UnknownJob,
            format!("no job named '{}' is registered", frame.job),
        );
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            // No execution context means no frame; the parent will observe
            // the death, and stderr carries the reason.
            eprintln!("stellwerk worker: failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    // A scoped hook records where the panic happened; the default hook would
    // only print. The worker runs one task, so swapping the global hook is
    // uncontended here.
    let captured: Arc<Mutex<Option<PanicCapture>>> = Arc::new(Mutex::new(None));
    let hook_slot = Arc::clone(&captured);
    let previous_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let capture = PanicCapture {
            location: info.location().map(|l| l.to_string()),
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        };
        if let Ok(mut slot) = hook_slot.lock() {
            *slot = Some(capture);
        }
    }));

    let result = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(job.run(frame.payload))));
    panic::set_hook(previous_hook);

    match result {
        Ok(Ok(value)) => OutcomeFrame::Ok { data: value },
        Ok(Err(JobError::InvalidInput(message))) => {
            OutcomeFrame::err(WireErrorKind::Payload, message)
        }
        Ok(Err(JobError::Failed(message))) => OutcomeFrame::err(WireErrorKind::Error, message),
        Ok(Err(JobError::Other(e))) => {
            OutcomeFrame::err_with_trace(WireErrorKind::Error, format!("{e:#}"), format!("{e:?}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let capture = captured.lock().ok().and_then(|mut slot| slot.take());
            let trace = capture.map(|c| match c.location {
                Some(location) => format!("panicked at {location}\n{}", c.backtrace),
                None => c.backtrace,
            });
            match trace {
                Some(trace) => OutcomeFrame::err_with_trace(WireErrorKind::Panic, message, trace),
                None => OutcomeFrame::err(WireErrorKind::Panic, message),
            }
        }
    }
}

struct PanicCapture {
    location: Option<String>,
    backtrace: String,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Write the one outcome frame to stdout. Returns the process exit code.
fn respond(frame: &OutcomeFrame) -> i32 {
    let line = match proto::encode_line(frame) {
        Ok(line) => line,
        Err(e) => {
            // Fall back to a plain-string frame so the parent still gets a
            // report instead of a silent death.
            let fallback = OutcomeFrame::err(
                WireErrorKind::Result,
                format!("failed to encode outcome frame: {e}"),
            );
            match proto::encode_line(&fallback) {
                Ok(line) => line,
                Err(e) => {
                    eprintln!("stellwerk worker: failed to encode fallback frame: {e}");
                    return 1;
                }
            }
        }
    };

    let mut stdout = std::io::stdout().lock();
    let written = stdout
        .write_all(line.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush());
    match written {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("stellwerk worker: failed to write outcome frame: {e}");
            1
        }
    }
}
