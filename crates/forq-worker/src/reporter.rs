//! Lifecycle reporter chain.
//!
//! All queue pipelines fan their events into one chain task, which walks an
//! ordered list of reporters. A reporter may do I/O but a failing reporter
//! only produces a log line; it never interrupts the chain or the pipelines.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use forq_models::{Clock, Job, UniqueUntil};
use forq_queue::RedisClient;

use crate::error::WorkerResult;
use crate::event::JobEvent;
use crate::worker::PerformError;

/// Retry cap applied when a job's policy is plain `true`.
pub const DEFAULT_RETRY_CAP: u32 = 25;

/// A consumer of job lifecycle events.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Name used when logging reporter failures.
    fn name(&self) -> &'static str;

    /// React to one event.
    async fn handle(&self, event: &JobEvent) -> WorkerResult<()>;
}

/// Sequential dispatcher over the ordered reporter list.
pub struct ReporterChain {
    reporters: Vec<Box<dyn Reporter>>,
    events: mpsc::Receiver<JobEvent>,
}

impl ReporterChain {
    pub fn new(reporters: Vec<Box<dyn Reporter>>, events: mpsc::Receiver<JobEvent>) -> Self {
        Self { reporters, events }
    }

    /// Dispatch events until every producer handle is gone.
    pub async fn run(mut self) {
        debug!(reporters = self.reporters.len(), "reporter chain started");
        while let Some(event) = self.events.recv().await {
            for reporter in &self.reporters {
                if let Err(error) = reporter.handle(&event).await {
                    warn!(reporter = reporter.name(), %error, "reporter failed");
                }
            }
        }
        debug!("reporter chain stopped");
    }
}

/// The reporters every node runs, in dispatch order, followed by any
/// user-supplied extras.
pub(crate) fn standard_reporters(
    client: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    node_id: &str,
    extras: Vec<Box<dyn Reporter>>,
) -> Vec<Box<dyn Reporter>> {
    let mut reporters: Vec<Box<dyn Reporter>> = vec![
        Box::new(Retryer::new(client.clone(), clock, node_id.to_string())),
        Box::new(Unlocker::new(client.clone())),
        Box::new(BackupPruner::new(client, node_id.to_string())),
        Box::new(LogReporter),
    ];
    reporters.extend(extras);
    reporters
}

/// True while the job's policy still permits another attempt.
pub(crate) fn retry_allowed(job: &Job, default_cap: u32) -> bool {
    matches!(job.retry.cap(default_cap), Some(cap) if job.retry_count < cap)
}

/// Seconds until the next attempt. `jitter` is a draw from `0..30`.
pub(crate) fn backoff_seconds(retry_count: u32, jitter: u32) -> f64 {
    15.0 + f64::from(retry_count).powi(4) + f64::from(jitter) * f64::from(retry_count + 1)
}

/// The retried copy of a failed job: bumped count, failure bookkeeping and
/// the next due time.
pub(crate) fn build_retry(job: &Job, error: &PerformError, now: f64, jitter: u32) -> Job {
    let mut retried = job.clone();
    retried.retry_count = job.retry_count + 1;
    retried.failed_at = job.failed_at.or(Some(now));
    retried.retried_at = Some(now);
    retried.error_class = Some(error.class.clone());
    retried.error_message = Some(error.message.clone());
    retried.at = Some(now + backoff_seconds(job.retry_count, jitter));
    retried
}

/// Requeues failed jobs into the `retry` set, or drops them once their cap
/// is spent. Either way the backup entry is acknowledged here.
pub struct Retryer {
    client: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    node_id: String,
    rng: Mutex<StdRng>,
    retry_cap: u32,
}

impl Retryer {
    pub fn new(client: Arc<RedisClient>, clock: Arc<dyn Clock>, node_id: String) -> Self {
        Self {
            client,
            clock,
            node_id,
            rng: Mutex::new(StdRng::from_os_rng()),
            retry_cap: DEFAULT_RETRY_CAP,
        }
    }

    /// Seed the jitter source, for deterministic scheduling in tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }
}

#[async_trait]
impl Reporter for Retryer {
    fn name(&self) -> &'static str {
        "retryer"
    }

    async fn handle(&self, event: &JobEvent) -> WorkerResult<()> {
        let JobEvent::Failure { delivery, error, .. } = event else {
            return Ok(());
        };
        // Undecodable payloads were already acknowledged by the producer.
        let Some(job) = &delivery.job else {
            return Ok(());
        };

        if retry_allowed(job, self.retry_cap) {
            let jitter = self.rng.lock().await.random_range(0..30);
            let retried = build_retry(job, error, self.clock.unix_time(), jitter);
            self.client.retry(&retried).await?;
            info!(
                jid = %retried.jid,
                retry_count = retried.retry_count,
                error_class = %error.class,
                "job scheduled for retry"
            );
        } else {
            info!(jid = %job.jid, retry_count = job.retry_count, "retries exhausted; dropping job");
        }

        self.client
            .acknowledge(&delivery.queue, &self.node_id, &delivery.payload)
            .await?;
        Ok(())
    }
}

/// Releases unique locks at the point their policy names.
pub struct Unlocker {
    client: Arc<RedisClient>,
}

impl Unlocker {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    async fn release(&self, job: &Job, policy: UniqueUntil) -> WorkerResult<()> {
        if job.holds_lock() && job.effective_unique_until() == policy {
            if self.client.unlock(job).await? {
                debug!(jid = %job.jid, "unique lock released");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reporter for Unlocker {
    fn name(&self) -> &'static str {
        "unlocker"
    }

    async fn handle(&self, event: &JobEvent) -> WorkerResult<()> {
        match event {
            JobEvent::Started { delivery } => {
                if let Some(job) = &delivery.job {
                    self.release(job, UniqueUntil::Start).await?;
                }
            }
            JobEvent::Success { delivery, .. } | JobEvent::Failure { delivery, .. } => {
                if let Some(job) = &delivery.job {
                    self.release(job, UniqueUntil::Success).await?;
                }
            }
        }
        Ok(())
    }
}

/// Acknowledges the backup entry of every successful job. Failure paths are
/// acknowledged by the retryer.
pub struct BackupPruner {
    client: Arc<RedisClient>,
    node_id: String,
}

impl BackupPruner {
    pub fn new(client: Arc<RedisClient>, node_id: String) -> Self {
        Self { client, node_id }
    }
}

#[async_trait]
impl Reporter for BackupPruner {
    fn name(&self) -> &'static str {
        "backup_pruner"
    }

    async fn handle(&self, event: &JobEvent) -> WorkerResult<()> {
        if let JobEvent::Success { delivery, .. } = event {
            self.client
                .acknowledge(&delivery.queue, &self.node_id, &delivery.payload)
                .await?;
        }
        Ok(())
    }
}

/// One structured log line per lifecycle event.
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    fn name(&self) -> &'static str {
        "logger"
    }

    async fn handle(&self, event: &JobEvent) -> WorkerResult<()> {
        match event {
            JobEvent::Started { delivery } => {
                info!(
                    jid = delivery.jid(),
                    queue = %delivery.queue,
                    class = delivery.class(),
                    "job started"
                );
            }
            JobEvent::Success { delivery, duration, .. } => {
                info!(
                    jid = delivery.jid(),
                    queue = %delivery.queue,
                    class = delivery.class(),
                    elapsed_ms = duration.as_millis() as u64,
                    "job succeeded"
                );
            }
            JobEvent::Failure { delivery, error, duration } => {
                error!(
                    jid = delivery.jid(),
                    queue = %delivery.queue,
                    class = delivery.class(),
                    elapsed_ms = duration.as_millis() as u64,
                    error_class = %error.class,
                    error_message = %error.message,
                    "job failed"
                );
            }
        }
        Ok(())
    }
}
