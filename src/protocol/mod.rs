//! Wire protocol of the orchestration service.

pub mod agent;
pub mod connection;
pub mod connection_data;
pub mod job;
pub mod service;
pub mod session;
pub mod timeline;

pub use agent::{GitHubAuthResult, TaskAgent, TaskAgentPublicKey};
pub use connection::VssConnection;
pub use connection_data::ConnectionData;
pub use job::{AgentJobRequestMessage, JobEvent, TaskOrchestrationPlanReference};
pub use service::RunnerService;
pub use session::{SessionCipher, TaskAgentMessage, TaskAgentSession};
pub use timeline::{TaskResult, TimelineRecord, TimelineRecordWrapper};

/// Timestamp format used in every record the service stores.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
