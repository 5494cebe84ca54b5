//! In-memory [`RunnerService`] used by the engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectionError;
use crate::protocol::job::{JobEvent, TaskOrchestrationPlanReference};
use crate::protocol::service::RunnerService;
use crate::protocol::session::{SessionCipher, TaskAgentMessage, TaskAgentSession, TaskAgentSessionKey};
use crate::protocol::timeline::{TimelineRecord, TimelineRecordFeedLinesWrapper, TimelineRecordWrapper};

/// Plain AES key handed out with every fake session.
pub(crate) const SESSION_KEY: [u8; 16] = *b"0123456789abcdef";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    CreateSession,
    DeleteSession(String),
    GetMessage(String),
    DeleteMessage(i64),
    RenewJob(i64),
    FinishJob(JobEvent),
    UpdateTimeline(Vec<TimelineRecord>),
    UploadLog(String),
    AppendLines(TimelineRecordFeedLinesWrapper),
    JobService(String),
}

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<Call>>,
    sessions: Mutex<VecDeque<Result<TaskAgentSession, ConnectionError>>>,
    messages: Mutex<VecDeque<Result<Option<TaskAgentMessage>, ConnectionError>>>,
    finish_failures: AtomicU32,
    timeline_failures: AtomicU32,
    next_id: AtomicI64,
}

/// Records every call. Scripted answers are consumed in order; once the
/// message queue is empty `get_message` blocks until cancelled, like an
/// idle long poll.
#[derive(Clone, Default)]
pub(crate) struct FakeService {
    state: Arc<FakeState>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, result: Result<TaskAgentSession, ConnectionError>) {
        self.state.sessions.lock().unwrap().push_back(result);
    }

    pub fn push_message(&self, result: Result<Option<TaskAgentMessage>, ConnectionError>) {
        self.state.messages.lock().unwrap().push_back(result);
    }

    /// Fail the next `n` finish reports.
    pub fn fail_finish(&self, n: u32) {
        self.state.finish_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` timeline updates.
    pub fn fail_timeline(&self, n: u32) {
        self.state.timeline_failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<JobEvent> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::FinishJob(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn appended(&self) -> Vec<TimelineRecordFeedLinesWrapper> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AppendLines(lines) => Some(lines),
                _ => None,
            })
            .collect()
    }

    /// Records sent with the most recent timeline update.
    pub fn last_timeline(&self) -> Vec<TimelineRecord> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::UpdateTimeline(records) => Some(records),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.state.calls.lock().unwrap().push(call);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn unavailable() -> ConnectionError {
    ConnectionError::Status {
        method: "POST".to_string(),
        url: "http://fake".to_string(),
        status: 503,
        request_body: String::new(),
        response_body: "unavailable".to_string(),
    }
}

/// A session with an unencrypted key.
pub(crate) fn plain_session(id: &str, request: &TaskAgentSession) -> TaskAgentSession {
    TaskAgentSession {
        session_id: id.to_string(),
        encryption_key: TaskAgentSessionKey {
            encrypted: false,
            value: STANDARD.encode(SESSION_KEY),
        },
        ..request.clone()
    }
}

/// Encrypt `body` the way the service does for the fake session key.
pub(crate) fn encrypted_message(message_id: i64, message_type: &str, body: &str) -> TaskAgentMessage {
    let cipher = SessionCipher::from_key(SESSION_KEY.to_vec()).unwrap();
    let iv = [7u8; 16];
    TaskAgentMessage {
        message_id,
        message_type: message_type.to_string(),
        iv: STANDARD.encode(iv),
        body: STANDARD.encode(cipher.encrypt(&iv, body.as_bytes())),
    }
}

#[async_trait]
impl RunnerService for FakeService {
    async fn create_session(&self, session: &TaskAgentSession) -> Result<TaskAgentSession, ConnectionError> {
        self.record(Call::CreateSession);
        let scripted = self.state.sessions.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => {
                let n = self.state.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(plain_session(&format!("session-{}", n), session))
            }
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ConnectionError> {
        self.record(Call::DeleteSession(session_id.to_string()));
        Ok(())
    }

    async fn get_message(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskAgentMessage>, ConnectionError> {
        self.record(Call::GetMessage(session_id.to_string()));
        let scripted = self.state.messages.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => {
                cancel.cancelled().await;
                Err(ConnectionError::Cancelled)
            }
        }
    }

    async fn delete_message(&self, _session_id: &str, message_id: i64) -> Result<(), ConnectionError> {
        self.record(Call::DeleteMessage(message_id));
        Ok(())
    }

    async fn renew_job(&self, request_id: i64) -> Result<(), ConnectionError> {
        self.record(Call::RenewJob(request_id));
        Ok(())
    }

    async fn finish_job(
        &self,
        _plan: &TaskOrchestrationPlanReference,
        event: &JobEvent,
    ) -> Result<(), ConnectionError> {
        self.record(Call::FinishJob(event.clone()));
        if Self::take_failure(&self.state.finish_failures) {
            return Err(unavailable());
        }
        Ok(())
    }

    async fn update_timeline(
        &self,
        _plan: &TaskOrchestrationPlanReference,
        _timeline_id: &str,
        records: &TimelineRecordWrapper,
    ) -> Result<(), ConnectionError> {
        self.record(Call::UpdateTimeline(records.value.clone()));
        if Self::take_failure(&self.state.timeline_failures) {
            return Err(unavailable());
        }
        Ok(())
    }

    async fn upload_log_file(
        &self,
        _plan: &TaskOrchestrationPlanReference,
        _timeline_id: &str,
        content: &str,
    ) -> Result<i64, ConnectionError> {
        self.record(Call::UploadLog(content.to_string()));
        Ok(100 + self.state.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn append_timeline_lines(
        &self,
        _plan: &TaskOrchestrationPlanReference,
        _timeline_id: &str,
        lines: &TimelineRecordFeedLinesWrapper,
    ) -> Result<(), ConnectionError> {
        self.record(Call::AppendLines(lines.clone()));
        Ok(())
    }

    async fn job_service(&self, url: &str, _token: &str) -> Result<Arc<dyn RunnerService>, ConnectionError> {
        self.record(Call::JobService(url.to_string()));
        Ok(Arc::new(self.clone()))
    }
}
