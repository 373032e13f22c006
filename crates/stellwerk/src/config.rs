use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Runner configuration.
///
/// All duration fields are encoded as integer milliseconds in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of worker processes alive at once.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,

    /// How long `stop()` lets in-flight workers finish before force-killing
    /// them, in milliseconds.
    #[serde(default = "default_grace_period", with = "duration_millis")]
    pub grace_period: Duration,

    /// Completion stream buffer size per subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Deadline applied to every task that does not set its own, in
    /// milliseconds. Absent means no deadline.
    #[serde(
        default,
        with = "opt_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_timeout: Option<Duration>,

    /// Worker command; defaults to re-running the current executable.
    #[serde(default)]
    pub worker: WorkerCommand,
}

/// How to launch a worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to execute; `None` re-runs the current executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_max_processes() -> usize {
    4
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_event_capacity() -> usize {
    256
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            grace_period: default_grace_period(),
            event_capacity: default_event_capacity(),
            default_timeout: None,
            worker: WorkerCommand::default(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker.program = Some(program.into());
        self
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker.args = args;
        self
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, RunnerError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path, with `STELLWERK_*` environment
    /// variables overriding the file's values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the runner cannot operate with.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.max_processes == 0 {
            return Err(RunnerError::Config(
                "max_processes must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(RunnerError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.grace_period.is_zero() {
            return Err(RunnerError::Config(
                "grace_period must be nonzero".to_string(),
            ));
        }
        if matches!(self.default_timeout, Some(t) if t.is_zero()) {
            return Err(RunnerError::Config(
                "default_timeout must be nonzero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `STELLWERK_KEY` overrides `key`.
    /// - `STELLWERK_MAX_PROCESSES` -> `max_processes`
    /// - `STELLWERK_GRACE_PERIOD_MS` -> `grace_period`
    /// - `STELLWERK_EVENT_CAPACITY` -> `event_capacity`
    /// - `STELLWERK_DEFAULT_TIMEOUT_MS` -> `default_timeout`
    /// - `STELLWERK_WORKER_PROGRAM` -> `worker.program`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STELLWERK_MAX_PROCESSES") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_processes = n;
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_GRACE_PERIOD_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.grace_period = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_EVENT_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.event_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_DEFAULT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.default_timeout = Some(Duration::from_millis(ms));
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_WORKER_PROGRAM") {
            self.worker.program = Some(PathBuf::from(v));
        }
    }
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds.
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
