//! Worker contract and class-name resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use forq_models::{Job, JobArgs, RetryPolicy, UniqueUntil};

/// Error class reported when execution exceeds its deadline.
pub const TIMEOUT_ERROR_CLASS: &str = "Forq::Timeout";

/// Error class reported when execution is cancelled by shutdown.
pub const SHUTDOWN_ERROR_CLASS: &str = "Forq::Shutdown";

/// Error class reported for unparseable payloads.
pub const DECODE_ERROR_CLASS: &str = "Forq::DecodeError";

/// A failure raised by (or on behalf of) a worker's `perform`.
///
/// `class` is the wire-visible error identity recorded on retried jobs;
/// generic failures use `RuntimeError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformError {
    pub class: String,
    pub message: String,
}

impl PerformError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Generic execution failure.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }
}

impl fmt::Display for PerformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for PerformError {}

impl From<String> for PerformError {
    fn from(message: String) -> Self {
        Self::runtime(message)
    }
}

impl From<&str> for PerformError {
    fn from(message: &str) -> Self {
        Self::runtime(message)
    }
}

/// Outcome of one execution. The success value is handed to the reporter
/// chain alongside the job.
pub type PerformResult = Result<Value, PerformError>;

/// A worker type.
///
/// One instance is created per execution; instances never outlive a single
/// job. The option hooks declare the defaults applied to jobs built through
/// [`WorkerRegistry::job`].
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute the job.
    async fn perform(&self, args: JobArgs) -> PerformResult;

    /// Retry policy for jobs of this type.
    fn retry(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Unique-lock lifetime, when jobs of this type are unique.
    fn unique_for(&self) -> Option<Duration> {
        None
    }

    /// Unique-lock release policy.
    fn unique_until(&self) -> Option<UniqueUntil> {
        None
    }

    /// Per-execution deadline. `None` means unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// Maps job class strings to worker factories.
///
/// The embedding host registers its worker types here and hands the registry
/// to the supervisor; resolution is a plain lookup, with a fresh instance
/// built per execution.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker type under its class identifier.
    pub fn register<W, F>(&mut self, class: impl Into<String>, factory: F)
    where
        W: Worker + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.factories
            .insert(class.into(), Arc::new(move || Box::new(factory())));
    }

    /// Build a fresh worker for the class, if one is registered.
    pub fn resolve(&self, class: &str) -> Option<Box<dyn Worker>> {
        self.factories.get(class).map(|factory| factory())
    }

    /// Build a job for the class with the worker's declared options applied.
    pub fn job(&self, class: &str) -> Option<Job> {
        let worker = self.resolve(class)?;
        let mut job = Job::new(class).with_retry(worker.retry());
        if let Some(unique_for) = worker.unique_for() {
            job = job.with_unique_for(unique_for.as_millis() as u64);
        }
        if let Some(until) = worker.unique_until() {
            job = job.with_unique_until(until);
        }
        Some(job)
    }

    /// Registered class names.
    pub fn classes(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}
