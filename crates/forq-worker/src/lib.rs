//! Worker-side runtime for the forq job engine.
//!
//! This crate provides:
//! - The `Worker` trait and class-name registry
//! - Per-queue pipelines pulling jobs under bounded concurrency
//! - The lifecycle reporter chain (retry, unique unlock, backup pruning,
//!   logging, user reporters)
//! - Periodic schedulers for the delayed and retry sets
//! - A supervisor with boot-time crash recovery and graceful shutdown

pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod reporter;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use event::{Delivery, JobEvent};
pub use pipeline::QueuePipeline;
pub use reporter::{
    BackupPruner, LogReporter, Reporter, ReporterChain, Retryer, Unlocker, DEFAULT_RETRY_CAP,
};
pub use scheduler::Scheduler;
pub use supervisor::{ShutdownHandle, Supervisor};
pub use worker::{
    PerformError, PerformResult, Worker, WorkerRegistry, DECODE_ERROR_CLASS,
    SHUTDOWN_ERROR_CLASS, TIMEOUT_ERROR_CLASS,
};
