//! Redis key layout.
//!
//! The names here are shared storage contract with other runtimes pointed at
//! the same Redis, so they must not change.

/// Set of known queue names.
pub const QUEUES: &str = "queues";

/// Sorted set of jobs scheduled for a later enqueue, scored by due time.
pub const SCHEDULE: &str = "schedule";

/// Sorted set of jobs awaiting their next retry attempt, scored by due time.
pub const RETRY: &str = "retry";

/// FIFO list of a queue's pending payloads (head = newest).
pub fn queue(name: &str) -> String {
    format!("queue:{name}")
}

/// Per-node backup list mirroring this node's in-flight payloads.
pub fn backup(name: &str, node_id: &str) -> String {
    format!("queue:{name}:{node_id}")
}

/// Unique-lock key for a job's uniqueness token.
pub fn unique(token: &str) -> String {
    format!("unique:{token}")
}
