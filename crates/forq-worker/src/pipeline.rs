//! Per-queue pipeline: a demand-driven producer and a bounded executor pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use forq_models::Job;
use forq_queue::RedisClient;

use crate::error::{WorkerError, WorkerResult};
use crate::event::{Delivery, JobEvent};
use crate::worker::{
    PerformError, PerformResult, WorkerRegistry, DECODE_ERROR_CLASS, SHUTDOWN_ERROR_CLASS,
    TIMEOUT_ERROR_CLASS,
};

/// Pieces shared by every pipeline of one node.
#[derive(Clone)]
pub(crate) struct PipelineShared {
    pub client: Arc<RedisClient>,
    pub registry: Arc<WorkerRegistry>,
    pub events: mpsc::Sender<JobEvent>,
    pub node_id: String,
    pub poll_interval: Duration,
    /// Producers stop fetching when this flips.
    pub quiesce: watch::Receiver<bool>,
    /// Running executions observe this as cancellation.
    pub cancel: watch::Receiver<bool>,
}

/// One queue's producer and executor pool.
///
/// The producer only ever fetches as many payloads as the pool has free
/// permits, so at any instant the in-flight set for this node and queue is
/// exactly the backup list's contents.
#[derive(Clone)]
pub struct QueuePipeline {
    queue: String,
    semaphore: Arc<Semaphore>,
    shared: PipelineShared,
}

impl QueuePipeline {
    pub(crate) fn new(queue: String, semaphore: Arc<Semaphore>, shared: PipelineShared) -> Self {
        Self {
            queue,
            semaphore,
            shared,
        }
    }

    /// Pull and execute jobs until shutdown.
    ///
    /// Transport errors are returned so the supervisor can restart the
    /// pipeline with backoff; fetched-but-unfinished payloads stay in the
    /// backup list either way.
    pub async fn run(mut self) -> WorkerResult<()> {
        info!(queue = %self.queue, "queue pipeline started");

        loop {
            if *self.shared.quiesce.borrow() || self.shared.quiesce.has_changed().is_err() {
                break;
            }

            let demand = self.semaphore.available_permits();
            if demand == 0 {
                self.idle(Duration::from_millis(50)).await;
                continue;
            }

            let payloads = self
                .shared
                .client
                .dequeue(&self.queue, demand, &self.shared.node_id)
                .await?;

            if payloads.is_empty() {
                self.idle(self.shared.poll_interval).await;
                continue;
            }

            for payload in payloads {
                self.dispatch(payload).await?;
            }
        }

        info!(queue = %self.queue, "queue pipeline stopped");
        Ok(())
    }

    /// Sleep, waking early when shutdown is signalled.
    async fn idle(&mut self, interval: Duration) {
        let quiesce = &mut self.shared.quiesce;
        tokio::select! {
            _ = quiesce.changed() => {}
            _ = sleep(interval) => {}
        }
    }

    async fn dispatch(&self, payload: String) -> WorkerResult<()> {
        let job = match Job::decode(&payload) {
            Ok(job) => job,
            Err(error) => {
                // Poison pill: acknowledge so it cannot loop forever.
                warn!(queue = %self.queue, %error, "undecodable payload; acknowledging");
                self.shared
                    .client
                    .acknowledge(&self.queue, &self.shared.node_id, &payload)
                    .await?;
                let delivery = Delivery {
                    queue: self.queue.clone(),
                    payload,
                    job: None,
                };
                self.emit(JobEvent::Failure {
                    delivery,
                    error: PerformError::new(DECODE_ERROR_CLASS, error.to_string()),
                    duration: Duration::ZERO,
                })
                .await;
                return Ok(());
            }
        };

        // The fetch was bounded by available permits, so this never blocks
        // for long; an error means the pool is gone entirely.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::runtime("executor pool closed"))?;

        let execution = Execution {
            registry: self.shared.registry.clone(),
            events: self.shared.events.clone(),
            cancel: self.shared.cancel.clone(),
            delivery: Delivery {
                queue: self.queue.clone(),
                payload,
                job: Some(job),
            },
        };

        tokio::spawn(async move {
            let _permit = permit;
            execution.run().await;
        });
        Ok(())
    }

    async fn emit(&self, event: JobEvent) {
        if self.shared.events.send(event).await.is_err() {
            warn!(queue = %self.queue, "reporter chain is gone; event dropped");
        }
    }
}

/// A single job execution on its own task.
struct Execution {
    registry: Arc<WorkerRegistry>,
    events: mpsc::Sender<JobEvent>,
    cancel: watch::Receiver<bool>,
    delivery: Delivery,
}

impl Execution {
    async fn run(mut self) {
        let Some(job) = self.delivery.job.clone() else {
            return;
        };

        let started = Instant::now();
        self.emit(JobEvent::Started {
            delivery: self.delivery.clone(),
        })
        .await;

        let outcome = self.perform(&job).await;
        let duration = started.elapsed();

        match outcome {
            Ok(result) => {
                self.emit(JobEvent::Success {
                    delivery: self.delivery.clone(),
                    result,
                    duration,
                })
                .await;
            }
            Err(error) => {
                let mut delivery = self.delivery.clone();
                if let Some(job) = delivery.job.as_mut() {
                    job.error_class = Some(error.class.clone());
                    job.error_message = Some(error.message.clone());
                }
                self.emit(JobEvent::Failure {
                    delivery,
                    error,
                    duration,
                })
                .await;
            }
        }
    }

    async fn perform(&mut self, job: &Job) -> PerformResult {
        let Some(worker) = self.registry.resolve(&job.class) else {
            return Err(PerformError::new(job.class.clone(), "is not registered"));
        };

        let deadline = worker.timeout();
        let args = job.args.clone();
        let work = async move {
            match deadline {
                Some(limit) => match timeout(limit, worker.perform(args)).await {
                    Ok(result) => result,
                    Err(_) => Err(PerformError::new(
                        TIMEOUT_ERROR_CLASS,
                        format!("execution expired after {:.1}s", limit.as_secs_f64()),
                    )),
                },
                None => worker.perform(args).await,
            }
        };

        tokio::select! {
            result = work => result,
            _ = cancelled(&mut self.cancel) => {
                Err(PerformError::new(SHUTDOWN_ERROR_CLASS, "execution cancelled by shutdown"))
            }
        }
    }

    async fn emit(&self, event: JobEvent) {
        if self.events.send(event).await.is_err() {
            warn!(queue = %self.delivery.queue, "reporter chain is gone; event dropped");
        }
    }
}

/// Resolves once cancellation is signalled. Stays pending forever when the
/// sender disappears without signalling, so a dropped supervisor never
/// aborts a running job by accident.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
