//! Parent/worker wire protocol: newline-delimited JSON over the child's
//! stdin and stdout.
//!
//! Exactly one [`JobFrame`] travels parent → worker and exactly one
//! [`OutcomeFrame`] travels back. The outcome frame carries no task id;
//! correlation is structural, one channel per worker. Worker-mode detection
//! happens through [`WORKER_ENV_VAR`] rather than argv so host binaries keep
//! their own argument parsing untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::task::{FailureKind, Outcome, TaskFailure, TaskId};

/// Set on a spawned child to divert it into worker mode.
pub(crate) const WORKER_ENV_VAR: &str = "STELLWERK_WORKER";

/// Task id of the spawned child, for diagnostics (`ps`, worker log spans).
pub(crate) const TASK_ENV_VAR: &str = "STELLWERK_TASK";

/// The one frame a worker receives: which job to run and with what input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct JobFrame {
    pub id: TaskId,
    pub job: String,
    pub payload: Value,
}

/// The one frame a worker reports back.
///
/// A job *failure* is still a successful report; only a missing frame means
/// the worker died.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum OutcomeFrame {
    Ok {
        data: Value,
    },
    Err {
        kind: WireErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
}

/// Failure kinds a worker itself can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum WireErrorKind {
    /// The job name resolved on the host but not in the worker's registry.
    UnknownJob,
    /// The payload could not be decoded.
    Payload,
    /// The result could not be encoded.
    Result,
    /// The job returned an error.
    Error,
    /// The job panicked.
    Panic,
}

impl OutcomeFrame {
    pub(crate) fn err(kind: WireErrorKind, message: impl Into<String>) -> Self {
        OutcomeFrame::Err {
            kind,
            message: message.into(),
            trace: None,
        }
    }

    pub(crate) fn err_with_trace(
        kind: WireErrorKind,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        OutcomeFrame::Err {
            kind,
            message: message.into(),
            trace: Some(trace.into()),
        }
    }

    /// Convert the reported frame into the outcome delivered to the caller.
    pub(crate) fn into_outcome(self) -> Outcome {
        match self {
            OutcomeFrame::Ok { data } => Outcome::Completed(data),
            OutcomeFrame::Err {
                kind,
                message,
                trace,
            } => {
                let kind = match kind {
                    WireErrorKind::UnknownJob => FailureKind::Spawn,
                    WireErrorKind::Payload | WireErrorKind::Result => FailureKind::Serialization,
                    WireErrorKind::Error => FailureKind::Error,
                    WireErrorKind::Panic => FailureKind::Panic,
                };
                Outcome::Failed(TaskFailure {
                    kind,
                    message,
                    trace,
                })
            }
        }
    }
}

/// Encode a frame as a single JSON line (without the trailing newline).
pub(crate) fn encode_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a frame from one line.
pub(crate) fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Write one frame line and flush.
pub(crate) async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read lines until an outcome frame parses or the channel reaches EOF.
///
/// Returns `None` on EOF. Non-frame lines (a job writing to raw stdout) are
/// logged and skipped so they cannot break the protocol.
pub(crate) async fn read_outcome<R>(reader: &mut R) -> std::io::Result<Option<OutcomeFrame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None); // EOF
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match decode_line::<OutcomeFrame>(trimmed) {
            Ok(frame) => return Ok(Some(frame)),
            Err(_) => {
                warn!(line = %trimmed, "skipping non-frame line on worker stdout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_frame_roundtrip() {
        let frame = JobFrame {
            id: TaskId::from("t-7"),
            job: "sum_squares".to_string(),
            payload: serde_json::json!({ "n": 10 }),
        };
        let line = encode_line(&frame).unwrap();
        let back: JobFrame = decode_line(&line).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn outcome_frame_is_status_tagged() {
        let ok = OutcomeFrame::Ok {
            data: serde_json::json!(99),
        };
        let line = encode_line(&ok).unwrap();
        assert!(line.contains(r#""status":"ok""#));

        let err = OutcomeFrame::err(WireErrorKind::Panic, "boom");
        let line = encode_line(&err).unwrap();
        assert!(line.contains(r#""status":"err""#));
        assert!(line.contains(r#""kind":"panic""#));
        // absent trace is omitted, not null
        assert!(!line.contains("trace"));
    }

    #[test]
    fn wire_kinds_map_to_failure_kinds() {
        let cases = [
            (WireErrorKind::UnknownJob, FailureKind::Spawn),
            (WireErrorKind::Payload, FailureKind::Serialization),
            (WireErrorKind::Result, FailureKind::Serialization),
            (WireErrorKind::Error, FailureKind::Error),
            (WireErrorKind::Panic, FailureKind::Panic),
        ];
        for (wire, expected) in cases {
            let outcome = OutcomeFrame::err(wire, "x").into_outcome();
            assert_eq!(outcome.failure().map(|f| f.kind), Some(expected));
        }

        let ok = OutcomeFrame::Ok {
            data: serde_json::json!({ "sum": 1 }),
        }
        .into_outcome();
        assert_eq!(ok.completed(), Some(&serde_json::json!({ "sum": 1 })));
    }

    #[test]
    fn decode_rejects_junk() {
        assert!(decode_line::<OutcomeFrame>("not json at all").is_err());
        assert!(decode_line::<OutcomeFrame>(r#"{"status":"nope"}"#).is_err());
    }

    #[tokio::test]
    async fn read_outcome_skips_junk_lines() {
        let input = b"progress: 50%\n\n{\"status\":\"ok\",\"data\":42}\n";
        let mut reader = tokio::io::BufReader::new(&input[..]);
        let frame = read_outcome(&mut reader).await.unwrap();
        assert_eq!(
            frame,
            Some(OutcomeFrame::Ok {
                data: serde_json::json!(42)
            })
        );
    }

    #[tokio::test]
    async fn read_outcome_hits_eof_on_junk_only() {
        let input = b"garbage\nmore garbage\n";
        let mut reader = tokio::io::BufReader::new(&input[..]);
        let frame = read_outcome(&mut reader).await.unwrap();
        assert_eq!(frame, None);
    }

    #[tokio::test]
    async fn write_frame_appends_newline() {
        let mut buf: Vec<u8> = Vec::new();
        let frame = OutcomeFrame::Ok {
            data: serde_json::json!(null),
        };
        write_frame(&mut buf, &frame).await.unwrap();
        assert!(buf.ends_with(b"\n"));
        let line = String::from_utf8(buf).unwrap();
        let back: OutcomeFrame = decode_line(&line).unwrap();
        assert_eq!(back, frame);
    }
}
