//! Node lifecycle: boot recovery, component startup, restart and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use forq_models::{Clock, SystemClock};
use forq_queue::RedisClient;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::pipeline::{PipelineShared, QueuePipeline};
use crate::reporter::{standard_reporters, Reporter, ReporterChain};
use crate::scheduler::Scheduler;
use crate::worker::WorkerRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const PIPELINE_RESTART_BACKOFF: Duration = Duration::from_millis(500);
const PIPELINE_RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);
const SCHEDULER_PERIOD: Duration = Duration::from_secs(1);

/// Requests a graceful stop of a running supervisor.
#[derive(Clone)]
pub struct ShutdownHandle {
    quiesce: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Begin graceful shutdown: producers stop first, in-flight jobs get
    /// the configured grace period.
    pub fn shutdown(&self) {
        let _ = self.quiesce.send(true);
    }
}

/// Starts, orders and restarts the worker-side components.
///
/// Startup order: resurrect this node's backup lists, then the reporter
/// chain, the queue pipelines, and finally the schedulers. Pipelines that
/// die on transport errors are restarted with exponential backoff; their
/// in-flight payloads wait in the backup list meanwhile.
pub struct Supervisor {
    config: WorkerConfig,
    client: Arc<RedisClient>,
    registry: Arc<WorkerRegistry>,
    clock: Arc<dyn Clock>,
    extra_reporters: Vec<Box<dyn Reporter>>,
    quiesce: Arc<watch::Sender<bool>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig, client: Arc<RedisClient>, registry: WorkerRegistry) -> Self {
        let (quiesce, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            client,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            extra_reporters: Vec::new(),
            quiesce: Arc::new(quiesce),
            cancel: Arc::new(cancel),
        }
    }

    /// Connect a fresh client pool from the configuration and build a
    /// supervisor around it.
    pub async fn connect(config: WorkerConfig, registry: WorkerRegistry) -> WorkerResult<Self> {
        let client = Arc::new(RedisClient::connect(config.redis.clone()).await?);
        Ok(Self::new(config, client, registry))
    }

    /// The underlying Redis client, for producing jobs through the same
    /// pool this node consumes with.
    pub fn client(&self) -> Arc<RedisClient> {
        self.client.clone()
    }

    /// Append a user reporter, invoked after the standard ones.
    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.extra_reporters.push(reporter);
        self
    }

    /// Substitute the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle for requesting shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            quiesce: self.quiesce.clone(),
        }
    }

    /// Run the node until interrupted or shut down through a handle.
    pub async fn run(self) -> WorkerResult<()> {
        if !self.config.server {
            info!("server mode disabled; supervisor starts nothing");
            return Ok(());
        }

        self.resurrect().await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reporters = standard_reporters(
            self.client.clone(),
            self.clock.clone(),
            &self.config.node_id,
            self.extra_reporters,
        );
        let chain_task = tokio::spawn(ReporterChain::new(reporters, events_rx).run());

        let shared = PipelineShared {
            client: self.client.clone(),
            registry: self.registry.clone(),
            events: events_tx,
            node_id: self.config.node_id.clone(),
            poll_interval: self.config.poll_interval,
            quiesce: self.quiesce.subscribe(),
            cancel: self.cancel.subscribe(),
        };

        let mut pools = Vec::with_capacity(self.config.queues.len());
        let mut pipeline_tasks = Vec::with_capacity(self.config.queues.len());
        for (queue, concurrency) in &self.config.queues {
            let semaphore = Arc::new(Semaphore::new(*concurrency));
            pools.push((semaphore.clone(), *concurrency));

            let pipeline = QueuePipeline::new(queue.clone(), semaphore, shared.clone());
            let queue_name = queue.clone();
            let mut quiesce_rx = self.quiesce.subscribe();

            pipeline_tasks.push(tokio::spawn(async move {
                let mut backoff = PIPELINE_RESTART_BACKOFF;
                loop {
                    match pipeline.clone().run().await {
                        Ok(()) => break,
                        Err(error) => {
                            error!(
                                queue = %queue_name,
                                %error,
                                backoff_ms = backoff.as_millis() as u64,
                                "queue pipeline failed; restarting"
                            );
                            sleep(backoff).await;
                            backoff = (backoff * 2).min(PIPELINE_RESTART_BACKOFF_CAP);
                        }
                    }
                    if *quiesce_rx.borrow_and_update() {
                        break;
                    }
                }
            }));
        }
        drop(shared);

        let mut scheduler_tasks = Vec::with_capacity(self.config.scheduler_sets.len());
        for set in &self.config.scheduler_sets {
            let scheduler = Scheduler::new(
                set.clone(),
                self.client.clone(),
                self.clock.clone(),
                SCHEDULER_PERIOD,
                self.quiesce.subscribe(),
            );
            scheduler_tasks.push(tokio::spawn(scheduler.run()));
        }

        info!(
            node_id = %self.config.node_id,
            queues = self.config.queues.len(),
            schedulers = self.config.scheduler_sets.len(),
            "worker node running"
        );

        let mut quiesce_rx = self.quiesce.subscribe();
        if !*quiesce_rx.borrow_and_update() {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received interrupt; shutting down"),
                _ = quiesce_rx.changed() => info!("shutdown requested"),
            }
        }
        let _ = self.quiesce.send(true);

        info!("draining in-flight jobs");
        let drained = timeout(self.config.shutdown_grace, drain(&pools)).await.is_ok();
        if !drained {
            warn!("shutdown grace elapsed; cancelling running jobs");
            let _ = self.cancel.send(true);
            // Give cancellation failures a moment to reach the chain; jobs
            // that ignore cancellation stay in the backup list for the next
            // boot's resurrection.
            sleep(Duration::from_secs(1)).await;
        }

        for task in pipeline_tasks {
            let _ = timeout(Duration::from_secs(5), task).await;
        }
        let _ = timeout(Duration::from_secs(5), chain_task).await;
        for task in scheduler_tasks {
            let _ = timeout(Duration::from_secs(5), task).await;
        }

        info!("supervisor stopped");
        Ok(())
    }

    /// Push every payload left in this node's backup lists back onto the
    /// tail of its queue, so work in flight at the last crash runs again.
    async fn resurrect(&self) -> WorkerResult<()> {
        for (queue, _) in &self.config.queues {
            let restored = self.client.resurrect(queue, &self.config.node_id).await?;
            if restored > 0 {
                info!(queue = %queue, count = restored, "resurrected in-flight jobs from backup");
            }
        }
        Ok(())
    }
}

/// Resolves once every executor pool is fully idle again.
async fn drain(pools: &[(Arc<Semaphore>, usize)]) {
    loop {
        if pools
            .iter()
            .all(|(semaphore, capacity)| semaphore.available_permits() == *capacity)
        {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
