//! Redis storage layer for the forq job engine.
//!
//! This crate provides:
//! - The producer/embedding API (`enqueue`, `enqueue_in`, `enqueue_at`,
//!   `clear_all`)
//! - The worker-facing storage contract (`dequeue`, `acknowledge`,
//!   `deschedule`, `retry`, `unlock`, `resurrect`)
//! - The unique-lock primitive and the server-side atomic scripts
//!
//! Nothing outside this crate talks to Redis.

pub mod client;
pub mod config;
pub mod error;
pub mod keys;
mod scripts;

pub use client::RedisClient;
pub use config::RedisConfig;
pub use error::{QueueError, QueueResult};
