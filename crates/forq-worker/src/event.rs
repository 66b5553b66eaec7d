//! Job lifecycle events.

use std::time::Duration;

use serde_json::Value;

use forq_models::Job;

use crate::worker::PerformError;

/// A payload pulled from a queue, paired with its decoded job.
///
/// The raw payload string must survive to acknowledgement: the backup list
/// is pruned by exact byte match, so re-encoding is never an option. `job`
/// is absent for payloads that failed to decode.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the payload was fetched from.
    pub queue: String,
    /// Exact payload bytes as fetched.
    pub payload: String,
    /// Decoded job, when the payload parsed.
    pub job: Option<Job>,
}

impl Delivery {
    /// jid for logging, or `"-"` for undecodable payloads.
    pub fn jid(&self) -> &str {
        self.job.as_ref().map_or("-", |job| job.jid.as_str())
    }

    /// class for logging, or `"-"` for undecodable payloads.
    pub fn class(&self) -> &str {
        self.job.as_ref().map_or("-", |job| job.class.as_str())
    }
}

/// Lifecycle event dispatched to the reporter chain.
///
/// For a given job, `Started` always precedes `Success` or `Failure`, and a
/// `Failure` event's job already carries `error_class` / `error_message`.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Execution is about to begin.
    Started { delivery: Delivery },
    /// `perform` returned normally.
    Success {
        delivery: Delivery,
        result: Value,
        duration: Duration,
    },
    /// Execution failed: decode, resolve, perform, timeout or cancellation.
    Failure {
        delivery: Delivery,
        error: PerformError,
        duration: Duration,
    },
}

impl JobEvent {
    /// The delivery this event concerns.
    pub fn delivery(&self) -> &Delivery {
        match self {
            Self::Started { delivery }
            | Self::Success { delivery, .. }
            | Self::Failure { delivery, .. } => delivery,
        }
    }

    /// Event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
        }
    }
}
