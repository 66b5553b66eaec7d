//! Worker node configuration.

use std::fmt::Write as _;
use std::time::Duration;

use rand::RngCore;

use forq_queue::RedisConfig;

/// Concurrency used for queues configured without an explicit limit.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Worker node configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis connection settings.
    pub redis: RedisConfig,
    /// Queues to pull from, each with its concurrency limit.
    pub queues: Vec<(String, usize)>,
    /// Sorted sets drained by the schedulers.
    pub scheduler_sets: Vec<String>,
    /// Producer sleep when a fetch comes back empty.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs before cancelling them.
    pub shutdown_grace: Duration,
    /// Identifier of this node's backup lists.
    pub node_id: String,
    /// When false, only the embedding API is available and the supervisor
    /// starts nothing.
    pub server: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            queues: vec![("default".to_string(), DEFAULT_CONCURRENCY)],
            scheduler_sets: vec!["schedule".to_string(), "retry".to_string()],
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(25),
            node_id: default_node_id(),
            server: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis: RedisConfig::from_env(),
            queues: std::env::var("FORQ_QUEUES")
                .ok()
                .map(|s| parse_queue_pairs(&s))
                .filter(|queues| !queues.is_empty())
                .unwrap_or(defaults.queues),
            scheduler_sets: std::env::var("FORQ_SCHEDULER_SETS")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|set| !set.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.scheduler_sets),
            poll_interval: Duration::from_millis(
                std::env::var("FORQ_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            shutdown_grace: Duration::from_secs(
                std::env::var("FORQ_SHUTDOWN_GRACE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(25),
            ),
            node_id: std::env::var("FORQ_NODE_ID").unwrap_or(defaults.node_id),
            server: std::env::var("FORQ_SERVER")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Replace the queue list.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        self.queues = queues
            .into_iter()
            .map(|(name, concurrency)| (name.into(), concurrency.max(1)))
            .collect();
        self
    }
}

/// Parse `"default:10,mailers:5"` into queue/concurrency pairs. A bare name
/// gets the default concurrency; malformed limits fall back to it too.
pub fn parse_queue_pairs(value: &str) -> Vec<(String, usize)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, limit)) => (
                name.trim().to_string(),
                limit.trim().parse().ok().filter(|n| *n > 0).unwrap_or(DEFAULT_CONCURRENCY),
            ),
            None => (entry.to_string(), DEFAULT_CONCURRENCY),
        })
        .collect()
}

/// Derive a node id unique across sibling processes and restarts on the
/// same host: `<hostname>.<pid>.<4 hex>`.
pub fn default_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());

    let mut suffix_bytes = [0u8; 2];
    rand::rng().fill_bytes(&mut suffix_bytes);
    let mut suffix = String::with_capacity(4);
    for byte in suffix_bytes {
        let _ = write!(suffix, "{:02x}", byte);
    }

    format!("{}.{}.{}", host, std::process::id(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_pulls_from_default_queue() {
        let config = WorkerConfig::default();
        assert_eq!(config.queues, vec![("default".to_string(), DEFAULT_CONCURRENCY)]);
        assert_eq!(
            config.scheduler_sets,
            vec!["schedule".to_string(), "retry".to_string()]
        );
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.server);
    }

    #[test]
    fn queue_pairs_parse_names_and_limits() {
        assert_eq!(
            parse_queue_pairs("default:10,mailers:5"),
            vec![("default".to_string(), 10), ("mailers".to_string(), 5)]
        );
        assert_eq!(
            parse_queue_pairs(" events , billing:2 "),
            vec![
                ("events".to_string(), DEFAULT_CONCURRENCY),
                ("billing".to_string(), 2)
            ]
        );
        assert_eq!(
            parse_queue_pairs("broken:zero,broken2:0"),
            vec![
                ("broken".to_string(), DEFAULT_CONCURRENCY),
                ("broken2".to_string(), DEFAULT_CONCURRENCY)
            ]
        );
        assert!(parse_queue_pairs("").is_empty());
    }

    #[test]
    fn node_ids_differ_between_calls() {
        let a = default_node_id();
        let b = default_node_id();
        assert_ne!(a, b);
        assert_eq!(a.split('.').count(), b.split('.').count());
    }

    #[test]
    fn with_queues_floors_concurrency_at_one() {
        let config = WorkerConfig::default().with_queues([("default", 0usize)]);
        assert_eq!(config.queues, vec![("default".to_string(), 1)]);
    }
}
