//! The job envelope.
//!
//! Jobs travel through Redis as JSON documents whose field names and value
//! shapes are shared with other runtimes reading the same keys, so the serde
//! attributes here are part of the storage contract: absent values are
//! omitted entirely and `retry_count` is omitted while it is zero.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::jid::random_jid;
use crate::time::unix_time;

/// Queue used when the producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Positional or keyword arguments for a worker's `perform`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobArgs {
    /// Ordered list of JSON values.
    List(Vec<Value>),
    /// Single keyword object.
    Map(serde_json::Map<String, Value>),
}

impl Default for JobArgs {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl JobArgs {
    /// True when there are no arguments at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(list) => list.is_empty(),
            Self::Map(map) => map.is_empty(),
        }
    }
}

impl From<Vec<Value>> for JobArgs {
    fn from(list: Vec<Value>) -> Self {
        Self::List(list)
    }
}

impl From<serde_json::Map<String, Value>> for JobArgs {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self::Map(map)
    }
}

/// Whether and how often a failed job is retried.
///
/// On the wire this is either a boolean or a non-negative integer cap, so
/// both shapes decode into one policy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    /// `true` retries up to the engine default, `false` never retries.
    Flag(bool),
    /// Retry at most this many times.
    Limit(u32),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl RetryPolicy {
    /// Effective retry cap: `None` means the job is never retried.
    pub fn cap(&self, default_cap: u32) -> Option<u32> {
        match self {
            Self::Flag(false) => None,
            Self::Flag(true) => Some(default_cap),
            Self::Limit(n) => Some(*n),
        }
    }
}

/// Point in the job lifecycle at which a unique lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueUntil {
    /// Release as soon as execution starts.
    Start,
    /// Hold until the job succeeds or is dropped.
    Success,
}

/// A unit of background work.
///
/// Producers build jobs with [`Job::new`] and the `with_*` setters; the
/// worker side decodes them from Redis payloads with [`Job::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// 24-hex identifier, unique per enqueue.
    pub jid: String,

    /// Worker type identifier.
    #[serde(alias = "module")]
    pub class: String,

    /// Arguments handed to `perform`.
    #[serde(default)]
    pub args: JobArgs,

    /// Target queue name.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Failed attempts so far.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,

    /// Unix seconds at which the job becomes due, when scheduled ahead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<f64>,

    /// Unix seconds at which the envelope was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,

    /// Unix seconds at which the job last entered a queue list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,

    /// Unix seconds of the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,

    /// Unix seconds of the most recent retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,

    /// Class name of the last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,

    /// Message of the last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Unique-lock lifetime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_for: Option<u64>,

    /// Lock release policy. Unrecognised wire values decode as absent.
    #[serde(
        default,
        deserialize_with = "de_unique_until",
        skip_serializing_if = "Option::is_none"
    )]
    pub unique_until: Option<UniqueUntil>,

    /// Deterministic lock token over class, queue and args.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_token: Option<String>,

    /// Unix milliseconds at which the unique lock expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocks_at: Option<u64>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn de_unique_until<'de, D>(deserializer: D) -> Result<Option<UniqueUntil>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => match s.as_str() {
            "start" => Some(UniqueUntil::Start),
            "success" => Some(UniqueUntil::Success),
            _ => None,
        },
        _ => None,
    })
}

impl Job {
    /// Create a job for the given worker class with a fresh jid and
    /// `created_at` stamped now.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            jid: random_jid(),
            class: class.into(),
            args: JobArgs::default(),
            queue: default_queue(),
            retry: RetryPolicy::default(),
            retry_count: 0,
            at: None,
            created_at: Some(unix_time()),
            enqueued_at: None,
            failed_at: None,
            retried_at: None,
            error_class: None,
            error_message: None,
            unique_for: None,
            unique_until: None,
            unique_token: None,
            unlocks_at: None,
        }
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: impl Into<JobArgs>) -> Self {
        self.args = args.into();
        self
    }

    /// Set the target queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Schedule the job for a future Unix time in seconds.
    pub fn with_at(mut self, at: f64) -> Self {
        self.at = Some(at);
        self
    }

    /// Request a unique lock held for the given number of milliseconds.
    pub fn with_unique_for(mut self, millis: u64) -> Self {
        self.unique_for = Some(millis);
        self
    }

    /// Set the lock release policy.
    pub fn with_unique_until(mut self, until: UniqueUntil) -> Self {
        self.unique_until = Some(until);
        self
    }

    /// Fill `jid` and `created_at` if a caller-supplied envelope lacks them.
    pub fn ensure_identity(&mut self) {
        if self.jid.is_empty() {
            self.jid = random_jid();
        }
        if self.created_at.is_none() {
            self.created_at = Some(unix_time());
        }
    }

    /// Serialise to the wire envelope.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a wire envelope.
    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Derive the uniqueness token: SHA-1 over `class|queue|args` with the
    /// arguments rendered as compact JSON. `serde_json` maps keep their keys
    /// in lexical order, so the rendering is stable across process runs.
    pub fn unique_token_value(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_default();
        let digest = Sha1::digest(format!("{}|{}|{}", self.class, self.queue, args).as_bytes());
        format!("{:x}", digest)
    }

    /// Lock release policy in effect while this job holds a lock. Absent
    /// means the lock survives until success.
    pub fn effective_unique_until(&self) -> UniqueUntil {
        self.unique_until.unwrap_or(UniqueUntil::Success)
    }

    /// True when this job carries a unique lock.
    pub fn holds_lock(&self) -> bool {
        self.unique_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Job {
        Job::new("HardWorker").with_args(vec![json!(1), json!("two")])
    }

    #[test]
    fn new_fills_identity_and_defaults() {
        let job = sample();
        assert_eq!(job.jid.len(), 24);
        assert_eq!(job.queue, "default");
        assert_eq!(job.retry, RetryPolicy::Flag(true));
        assert_eq!(job.retry_count, 0);
        assert!(job.created_at.is_some());
    }

    #[test]
    fn encode_omits_absent_fields_and_zero_retry_count() {
        let encoded = sample().encode().expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        let object = value.as_object().expect("object");

        assert!(object.contains_key("jid"));
        assert!(object.contains_key("created_at"));
        assert_eq!(object["retry"], json!(true));
        assert!(!object.contains_key("retry_count"));
        assert!(!object.contains_key("at"));
        assert!(!object.contains_key("error_class"));
        assert!(!object.contains_key("unique_for"));
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut job = sample().with_unique_for(60_000).with_unique_until(UniqueUntil::Success);
        job.retry_count = 3;
        job.error_class = Some("RuntimeError".to_string());
        job.error_message = Some("boom".to_string());
        job.unique_token = Some(job.unique_token_value());

        let decoded = Job::decode(&job.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, job);
    }

    #[test]
    fn decode_accepts_module_alias_and_unknown_fields() {
        let payload = json!({
            "jid": "a".repeat(24),
            "module": "Mailer",
            "args": [],
            "backtrace": true,
        })
        .to_string();

        let job = Job::decode(&payload).expect("decode");
        assert_eq!(job.class, "Mailer");
        assert_eq!(job.queue, "default");
    }

    #[test]
    fn decode_keeps_keyword_args_keyed() {
        let payload = json!({
            "jid": "b".repeat(24),
            "class": "Report",
            "args": {"user_id": 7, "dry_run": false},
        })
        .to_string();

        let job = Job::decode(&payload).expect("decode");
        match &job.args {
            JobArgs::Map(map) => {
                assert_eq!(map["user_id"], json!(7));
                assert_eq!(map["dry_run"], json!(false));
            }
            other => panic!("expected keyword args, got {other:?}"),
        }
    }

    #[test]
    fn unique_until_normalises_unknown_values_to_absent() {
        for (wire, expected) in [
            (json!("start"), Some(UniqueUntil::Start)),
            (json!("success"), Some(UniqueUntil::Success)),
            (json!("whenever"), None),
            (json!(17), None),
        ] {
            let payload = json!({
                "jid": "c".repeat(24),
                "class": "W",
                "unique_until": wire,
            })
            .to_string();
            let job = Job::decode(&payload).expect("decode");
            assert_eq!(job.unique_until, expected);
        }
    }

    #[test]
    fn retry_policy_decodes_bool_and_integer() {
        let flag = Job::decode(&json!({"jid": "d".repeat(24), "class": "W", "retry": false}).to_string())
            .expect("decode");
        assert_eq!(flag.retry, RetryPolicy::Flag(false));
        assert_eq!(flag.retry.cap(25), None);

        let limit = Job::decode(&json!({"jid": "e".repeat(24), "class": "W", "retry": 5}).to_string())
            .expect("decode");
        assert_eq!(limit.retry, RetryPolicy::Limit(5));
        assert_eq!(limit.retry.cap(25), Some(5));
        assert_eq!(RetryPolicy::Flag(true).cap(25), Some(25));
    }

    #[test]
    fn unique_token_is_deterministic_and_input_sensitive() {
        let a = Job::new("W").with_args(vec![json!(1)]);
        let b = Job::new("W").with_args(vec![json!(1)]);
        assert_eq!(a.unique_token_value(), b.unique_token_value());
        assert_eq!(a.unique_token_value().len(), 40);

        let other_args = Job::new("W").with_args(vec![json!(2)]);
        let other_queue = Job::new("W").with_args(vec![json!(1)]).with_queue("mailers");
        let other_class = Job::new("X").with_args(vec![json!(1)]);
        assert_ne!(a.unique_token_value(), other_args.unique_token_value());
        assert_ne!(a.unique_token_value(), other_queue.unique_token_value());
        assert_ne!(a.unique_token_value(), other_class.unique_token_value());
    }

    #[test]
    fn unique_token_ignores_map_key_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("a".to_string(), json!(1));
        first.insert("b".to_string(), json!(2));

        let mut second = serde_json::Map::new();
        second.insert("b".to_string(), json!(2));
        second.insert("a".to_string(), json!(1));

        let x = Job::new("W").with_args(first);
        let y = Job::new("W").with_args(second);
        assert_eq!(x.unique_token_value(), y.unique_token_value());
    }

    #[test]
    fn effective_unique_until_defaults_to_success() {
        let job = sample().with_unique_for(1000);
        assert_eq!(job.effective_unique_until(), UniqueUntil::Success);
        assert_eq!(
            sample().with_unique_until(UniqueUntil::Start).effective_unique_until(),
            UniqueUntil::Start
        );
    }

    #[test]
    fn ensure_identity_fills_missing_fields_only() {
        let mut job = sample();
        let jid = job.jid.clone();
        let created = job.created_at;
        job.ensure_identity();
        assert_eq!(job.jid, jid);
        assert_eq!(job.created_at, created);

        let mut blank = sample();
        blank.jid = String::new();
        blank.created_at = None;
        blank.ensure_identity();
        assert_eq!(blank.jid.len(), 24);
        assert!(blank.created_at.is_some());
    }
}
