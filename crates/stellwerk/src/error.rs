use thiserror::Error;

use crate::task::TaskId;

/// Errors surfaced synchronously by `submit`.
///
/// Everything else (spawn failures, job errors, worker death) is delivered
/// through the task's own handle, never here.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task id '{0}' is already live")]
    DuplicateId(TaskId),

    #[error("runner is stopped")]
    Stopped,
}

/// Errors from starting, configuring, or stopping the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("runner terminated unexpectedly")]
    Terminated,
}
