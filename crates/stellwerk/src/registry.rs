use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// A named unit of work executable inside a worker process.
///
/// Jobs run in the worker, not in the submitting host. The host and the
/// worker executable must register the same jobs under the same names; a task
/// carries only the name across the process boundary.
#[async_trait]
pub trait Job: Send + Sync {
    /// Unique name tasks use to address this job.
    fn name(&self) -> &str;

    /// Run the job against its JSON input.
    ///
    /// Input decoding is the job's responsibility; map decode failures to
    /// [`JobError::InvalidInput`] so they surface as serialization failures
    /// rather than plain errors.
    async fn run(&self, input: Value) -> Result<Value, JobError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Manages the jobs available to a runner and its workers.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Register a job. Returns an error if the name is already registered.
    pub fn register(&mut self, job: impl Job + 'static) -> Result<(), RegistryError> {
        let name = job.name().to_string();
        if self.jobs.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.jobs.insert(name, Arc::new(job));
        Ok(())
    }

    /// Look up a job by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted for stable output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job with name '{0}' is already registered")]
    DuplicateName(String),
}

/// Adapter wrapping an async closure as a [`Job`].
///
/// Built with [`job_fn`]; keeps registration terse for jobs that do not
/// warrant a dedicated type.
pub struct FnJob<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a job.
pub fn job_fn<F, Fut>(name: impl Into<String>, f: F) -> FnJob<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    FnJob {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: Value) -> Result<Value, JobError> {
        (self.f)(input).await
    }
}

/// Simple echo job for smoke tests: returns its input unchanged.
pub struct EchoJob;

#[async_trait]
impl Job for EchoJob {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, input: Value) -> Result<Value, JobError> {
        Ok(input)
    }
}
