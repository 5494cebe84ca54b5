//! Self-hosted runner agent.
//!
//! Attaches to a workflow orchestration service, long-polls an encrypted
//! message queue for jobs, runs them through a [`runner::executor::JobExecutor`]
//! and reports timeline records, logs and results back.

pub mod config;
pub mod error;
pub mod protocol;
pub mod runner;

pub use config::{AgentConfig, ProtocolTimings, StatePaths};
pub use error::{Error, Result};
