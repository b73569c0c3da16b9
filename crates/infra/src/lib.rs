//! Asynchronous job orchestration: durable job records, a polling worker,
//! handler dispatch and graceful shutdown.

pub mod config;
pub mod jobs;
pub mod workers;

pub use config::{ConfigError, JobsConfig};

#[cfg(test)]
mod integration_tests;
