//! Redis client implementing the whole storage contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, info};

use forq_models::time::{unix_time, unix_time_ms};
use forq_models::Job;

use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::keys;
use crate::scripts;

/// Client for every Redis operation the engine performs.
///
/// Holds a fixed set of long-lived multiplexed connections handed out
/// round-robin, one per command. Commands are never retried here; transport
/// errors propagate to the caller.
pub struct RedisClient {
    connections: Vec<MultiplexedConnection>,
    next: AtomicUsize,
    dequeue_script: Script,
    deschedule_script: Script,
    lock_script: Script,
    unlock_script: Script,
    resurrect_script: Script,
}

impl RedisClient {
    /// Connect a pool of `config.pool_size` connections.
    pub async fn connect(config: RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;

        let pool_size = config.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            connections.push(client.get_multiplexed_async_connection().await?);
        }
        info!(url = %config.url, pool_size, "connected to Redis");

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            dequeue_script: Script::new(scripts::DEQUEUE),
            deschedule_script: Script::new(scripts::DESCHEDULE),
            lock_script: Script::new(scripts::LOCK),
            unlock_script: Script::new(scripts::UNLOCK),
            resurrect_script: Script::new(scripts::RESURRECT),
        })
    }

    /// Connect using environment configuration.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(RedisConfig::from_env()).await
    }

    fn connection(&self) -> MultiplexedConnection {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }

    /// Store a job: scheduled jobs land in the `schedule` sorted set, due
    /// jobs at the head of their queue list.
    ///
    /// When the job asks for uniqueness the lock is taken first; if another
    /// jid already holds it the enqueue is suppressed and the returned job
    /// carries the holder's jid instead, with no new list entry.
    pub async fn enqueue(&self, mut job: Job) -> QueueResult<Job> {
        job.ensure_identity();

        if let Some(ttl_ms) = job.unique_for {
            let token = match &job.unique_token {
                Some(token) => token.clone(),
                None => {
                    let token = job.unique_token_value();
                    job.unique_token = Some(token.clone());
                    token
                }
            };

            let mut conn = self.connection();
            let holder: Option<String> = self
                .lock_script
                .key(keys::unique(&token))
                .arg(&job.jid)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;

            match holder {
                Some(holder) if holder != job.jid => {
                    debug!(jid = %holder, token = %token, "unique lock held; enqueue suppressed");
                    job.jid = holder;
                    return Ok(job);
                }
                _ => job.unlocks_at = Some(unix_time_ms() + ttl_ms),
            }
        }

        self.push(job).await
    }

    /// Enqueue after a positive delay. Rejects jobs that already carry a
    /// due time of their own.
    pub async fn enqueue_in(&self, mut job: Job, delay: Duration) -> QueueResult<Job> {
        if job.at.is_some() {
            return Err(QueueError::invalid_schedule(
                "job already has a due time; `in` and `at` are mutually exclusive",
            ));
        }
        if delay.is_zero() {
            return Err(QueueError::invalid_schedule("delay must be positive"));
        }
        job.at = Some(unix_time() + delay.as_secs_f64());
        self.enqueue(job).await
    }

    /// Enqueue due at an absolute Unix time in seconds.
    pub async fn enqueue_at(&self, mut job: Job, at: f64) -> QueueResult<Job> {
        if job.at.is_some() {
            return Err(QueueError::invalid_schedule(
                "job already has a due time; `in` and `at` are mutually exclusive",
            ));
        }
        job.at = Some(at);
        self.enqueue(job).await
    }

    async fn push(&self, mut job: Job) -> QueueResult<Job> {
        let now = unix_time();
        let mut conn = self.connection();

        if let Some(at) = job.at.filter(|at| *at > now) {
            let payload = job.encode()?;
            redis::cmd("ZADD")
                .arg(keys::SCHEDULE)
                .arg(at)
                .arg(&payload)
                .query_async::<()>(&mut conn)
                .await?;
            debug!(jid = %job.jid, queue = %job.queue, at, "job scheduled");
        } else {
            job.enqueued_at = Some(now);
            let payload = job.encode()?;
            redis::pipe()
                .atomic()
                .cmd("LPUSH")
                .arg(keys::queue(&job.queue))
                .arg(&payload)
                .ignore()
                .cmd("SADD")
                .arg(keys::QUEUES)
                .arg(&job.queue)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
            debug!(jid = %job.jid, queue = %job.queue, "job enqueued");
        }

        Ok(job)
    }

    /// Atomically move up to `count` payloads from the tail of the queue
    /// list into this node's backup list and return them. A fetched payload
    /// stays in the backup list until acknowledged.
    pub async fn dequeue(
        &self,
        queue: &str,
        count: usize,
        node_id: &str,
    ) -> QueueResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection();
        let payloads: Vec<String> = self
            .dequeue_script
            .key(keys::queue(queue))
            .key(keys::backup(queue, node_id))
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        Ok(payloads)
    }

    /// Remove a finished payload from this node's backup list. Matches the
    /// exact payload bytes, first occurrence from the head.
    pub async fn acknowledge(
        &self,
        queue: &str,
        node_id: &str,
        payload: &str,
    ) -> QueueResult<bool> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("LREM")
            .arg(keys::backup(queue, node_id))
            .arg(1)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    /// Move every entry of the named sorted set whose score is at or below
    /// `now` into its target queue list. Returns the number moved.
    pub async fn deschedule(&self, set: &str, now: f64) -> QueueResult<u64> {
        let mut conn = self.connection();
        let moved: i64 = self
            .deschedule_script
            .key(set)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved.max(0) as u64)
    }

    /// Re-insert a failed job into the `retry` sorted set, scored by the
    /// job's next due time. The caller sets the retry bookkeeping fields.
    pub async fn retry(&self, job: &Job) -> QueueResult<()> {
        let at = job
            .at
            .ok_or_else(|| QueueError::MissingRetryTime(job.jid.clone()))?;
        let payload = job.encode()?;

        let mut conn = self.connection();
        redis::cmd("ZADD")
            .arg(keys::RETRY)
            .arg(at)
            .arg(&payload)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(jid = %job.jid, retry_count = job.retry_count, at, "job queued for retry");
        Ok(())
    }

    /// Release a job's unique lock, but only while this jid still holds it.
    /// Returns whether a lock was deleted.
    pub async fn unlock(&self, job: &Job) -> QueueResult<bool> {
        let Some(token) = &job.unique_token else {
            return Ok(false);
        };

        let mut conn = self.connection();
        let deleted: i64 = self
            .unlock_script
            .key(keys::unique(token))
            .arg(&job.jid)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    /// Drain this node's backup list for a queue back onto the tail of the
    /// queue list, preserving order. Returns the number restored.
    pub async fn resurrect(&self, queue: &str, node_id: &str) -> QueueResult<u64> {
        let mut conn = self.connection();
        let moved: i64 = self
            .resurrect_script
            .key(keys::backup(queue, node_id))
            .key(keys::queue(queue))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved.max(0) as u64)
    }

    /// Delete every engine-managed key: queue lists, backup lists, both
    /// scheduled sets, unique locks and the known-queues set itself.
    pub async fn clear_all(&self) -> QueueResult<()> {
        let mut conn = self.connection();

        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys::QUEUES)
            .query_async(&mut conn)
            .await?;

        let mut doomed: Vec<String> = vec![
            keys::QUEUES.to_string(),
            keys::SCHEDULE.to_string(),
            keys::RETRY.to_string(),
        ];
        for queue in &queues {
            doomed.push(keys::queue(queue));
            let backups: Vec<String> = redis::cmd("KEYS")
                .arg(format!("queue:{queue}:*"))
                .query_async(&mut conn)
                .await?;
            doomed.extend(backups);
        }
        let locks: Vec<String> = redis::cmd("KEYS")
            .arg("unique:*")
            .query_async(&mut conn)
            .await?;
        doomed.extend(locks);

        for chunk in doomed.chunks(100) {
            redis::cmd("DEL")
                .arg(chunk)
                .query_async::<()>(&mut conn)
                .await?;
        }
        info!(keys = doomed.len(), "cleared all engine keys");
        Ok(())
    }

    /// Names registered in the known-queues set.
    pub async fn known_queues(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.connection();
        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys::QUEUES)
            .query_async(&mut conn)
            .await?;
        Ok(queues)
    }

    /// Length of a queue list.
    pub async fn queue_size(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.connection();
        let len: u64 = redis::cmd("LLEN")
            .arg(keys::queue(queue))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Length of this node's backup list for a queue.
    pub async fn backup_size(&self, queue: &str, node_id: &str) -> QueueResult<u64> {
        let mut conn = self.connection();
        let len: u64 = redis::cmd("LLEN")
            .arg(keys::backup(queue, node_id))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Cardinality of a scheduled sorted set.
    pub async fn scheduled_size(&self, set: &str) -> QueueResult<u64> {
        let mut conn = self.connection();
        let len: u64 = redis::cmd("ZCARD").arg(set).query_async(&mut conn).await?;
        Ok(len)
    }
}
