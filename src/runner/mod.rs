//! The agent engine: state files, message loop, job dispatch and lifecycle.

pub mod admission;
pub mod backoff;
pub mod dispatcher;
pub mod executor;
pub mod host_executor;
pub mod job_run;
pub mod lifecycle;
pub mod log_batcher;
pub mod masking;
pub mod message_loop;
pub mod migrate;
pub mod settings;
pub mod shutdown;
pub mod state;
pub mod timeline;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{JobDispatcher, JobHandle};
pub use executor::{ExecutionContext, ExecutionRequest, JobExecutor, JobOutcome};
pub use lifecycle::LifecycleController;
pub use shutdown::ShutdownController;
pub use worker::{Worker, WorkerReport};
