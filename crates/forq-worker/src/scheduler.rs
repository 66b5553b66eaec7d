//! Periodic movement of due jobs out of the scheduled sets.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

use forq_models::Clock;
use forq_queue::RedisClient;

/// Drains one sorted set on a jittered tick.
///
/// Every node runs its own schedulers against the same sets; the
/// server-side deschedule script keeps each entry's migration at-most-once,
/// and the jitter keeps the nodes from ticking in lockstep.
pub struct Scheduler {
    set: String,
    client: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        set: String,
        client: Arc<RedisClient>,
        clock: Arc<dyn Clock>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            set,
            client,
            clock,
            period,
            shutdown,
        }
    }

    /// Tick until shutdown. Deschedule errors are logged and the loop keeps
    /// ticking; pending entries simply wait for the next pass.
    pub async fn run(mut self) {
        info!(set = %self.set, "scheduler started");

        loop {
            let delay = jittered(self.period);
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(delay) => {
                    let now = self.clock.unix_time();
                    match self.client.deschedule(&self.set, now).await {
                        Ok(moved) if moved > 0 => {
                            debug!(set = %self.set, moved, "moved due jobs to their queues");
                        }
                        Ok(_) => {}
                        Err(error) => {
                            error!(set = %self.set, %error, "deschedule tick failed");
                        }
                    }
                }
            }
        }

        info!(set = %self.set, "scheduler stopped");
    }
}

/// The period scaled by a uniform factor in `[0.5, 1.5)`.
fn jittered(period: Duration) -> Duration {
    period.mul_f64(rand::rng().random_range(0.5..1.5))
}
