//! # Editions Worker
//!
//! Process wiring for the editions pipeline: environment configuration and the
//! timers that feed the editions queue. The `editions-worker` binary builds the
//! Postgres/Redis backends and runs one [`QueueWorker`](editions_runtime::QueueWorker)
//! group per queue.

pub mod config;
pub mod timers;

pub use config::{Config, ConfigError};
