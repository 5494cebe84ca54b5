//! The remote operations the runner engine depends on.
//!
//! [`VssConnection`](crate::protocol::connection::VssConnection) implements
//! this over HTTP; tests use an in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectionError;
use crate::protocol::job::{JobEvent, TaskOrchestrationPlanReference};
use crate::protocol::session::{TaskAgentMessage, TaskAgentSession};
use crate::protocol::timeline::{TimelineRecordFeedLinesWrapper, TimelineRecordWrapper};

#[async_trait]
pub trait RunnerService: Send + Sync {
    /// Register a new message session for the connection's agent.
    async fn create_session(&self, session: &TaskAgentSession) -> Result<TaskAgentSession, ConnectionError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), ConnectionError>;

    /// Long-poll for the next message. `Ok(None)` means the poll ended
    /// without a message.
    async fn get_message(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskAgentMessage>, ConnectionError>;

    async fn delete_message(&self, session_id: &str, message_id: i64) -> Result<(), ConnectionError>;

    /// Extend the job lock held by this agent.
    async fn renew_job(&self, request_id: i64) -> Result<(), ConnectionError>;

    async fn finish_job(
        &self,
        plan: &TaskOrchestrationPlanReference,
        event: &JobEvent,
    ) -> Result<(), ConnectionError>;

    async fn update_timeline(
        &self,
        plan: &TaskOrchestrationPlanReference,
        timeline_id: &str,
        records: &TimelineRecordWrapper,
    ) -> Result<(), ConnectionError>;

    /// Create a log file and upload `content` into it. Returns the log id.
    async fn upload_log_file(
        &self,
        plan: &TaskOrchestrationPlanReference,
        timeline_id: &str,
        content: &str,
    ) -> Result<i64, ConnectionError>;

    async fn append_timeline_lines(
        &self,
        plan: &TaskOrchestrationPlanReference,
        timeline_id: &str,
        lines: &TimelineRecordFeedLinesWrapper,
    ) -> Result<(), ConnectionError>;

    /// Connection scoped to one job, talking to `url` with the job token.
    async fn job_service(&self, url: &str, token: &str) -> Result<Arc<dyn RunnerService>, ConnectionError>;
}
