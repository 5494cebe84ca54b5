//! Session management and long polling for one runner instance.
//!
//! ```text
//! NoSession ──create──▶ Polling ──▶ message / empty / transient error
//!     ▲                    │
//!     └── expired, denied, stale (no exchange for 5 min)
//! ```
//!
//! Session creation backs off exponentially; an error saying the agent
//! registration is gone ends the loop with that error.

use std::sync::Arc;

use rsa::RsaPrivateKey;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolTimings;
use crate::error::{ConnectionError, Error};
use crate::protocol::agent::TaskAgent;
use crate::protocol::service::RunnerService;
use crate::protocol::session::{SessionCipher, TaskAgentMessage, TaskAgentSession};
use crate::runner::backoff::Backoff;
use crate::runner::state::AgentState;

struct ActiveSession {
    session: TaskAgentSession,
    cipher: SessionCipher,
}

pub struct MessageLoop {
    service: Arc<dyn RunnerService>,
    state: Arc<AgentState>,
    agent: TaskAgent,
    key: RsaPrivateKey,
    timings: ProtocolTimings,
    label: String,
    active: Option<ActiveSession>,
    last_success: Instant,
}

impl MessageLoop {
    pub fn new(
        service: Arc<dyn RunnerService>,
        state: Arc<AgentState>,
        agent: TaskAgent,
        key: RsaPrivateKey,
        timings: ProtocolTimings,
    ) -> Self {
        let label = agent.name.clone();
        Self {
            service,
            state,
            agent,
            key,
            timings,
            label,
            active: None,
            last_success: Instant::now(),
        }
    }

    /// Name used in log lines, e.g. `runner-1 ( https://github.com/octo )`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.session.session_id.as_str())
    }

    /// Cipher of the live session, used to open job requests.
    pub fn cipher(&self) -> Option<&SessionCipher> {
        self.active.as_ref().map(|a| &a.cipher)
    }

    /// Deal with sessions persisted by an earlier run. With `discard` they
    /// are deleted remotely and forgotten; otherwise the first usable one is
    /// adopted.
    pub async fn resume(&mut self, discard: bool) {
        if discard {
            let stale = match self.state.take_sessions_for(&self.agent).await {
                Ok(stale) => stale,
                Err(e) => {
                    tracing::warn!("Failed to update sessions.json: {}", e);
                    return;
                }
            };
            for session in stale {
                tracing::debug!("Deleting session {} of a previous run", session.session_id);
                if let Err(e) = self.service.delete_session(&session.session_id).await {
                    tracing::warn!("Failed to delete session {}: {}", session.session_id, e);
                }
            }
            return;
        }

        for session in self.state.sessions_for(&self.agent).await {
            match SessionCipher::derive(&session, &self.key) {
                Ok(cipher) => {
                    tracing::info!("Resuming session {} for {}", session.session_id, self.label);
                    self.active = Some(ActiveSession { session, cipher });
                    self.last_success = Instant::now();
                    return;
                }
                Err(e) => {
                    tracing::warn!("Persisted session {} is unusable: {}", session.session_id, e);
                    self.forget(&session.session_id).await;
                }
            }
        }
    }

    /// Wait for the next message. `Ok(None)` once `cancel` fires; `Err` only
    /// for registration-fatal errors. The message is not deleted.
    pub async fn next_message(&mut self, cancel: &CancellationToken) -> Result<Option<TaskAgentMessage>, ConnectionError> {
        loop {
            if cancel.is_cancelled() || !self.ensure_session(cancel).await? {
                return Ok(None);
            }
            let Some(session_id) = self.session_id().map(str::to_string) else {
                continue;
            };

            match self.service.get_message(&session_id, cancel).await {
                Ok(Some(message)) => {
                    self.last_success = Instant::now();
                    return Ok(Some(message));
                }
                Ok(None) => self.last_success = Instant::now(),
                Err(e) if e.is_no_content() => self.last_success = Instant::now(),
                Err(_) if cancel.is_cancelled() => return Ok(None),
                Err(ConnectionError::Cancelled) => return Ok(None),
                Err(e) if e.is_registration_fatal() => {
                    tracing::error!("Fatal: It seems this runner was removed from GitHub, {}: {}", self.label, e);
                    return Err(e);
                }
                Err(e) if e.is_session_invalid() => {
                    tracing::warn!("Failed to get message, recreating the session: {}", e);
                    self.drop_session().await;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to get message, waiting {:?} before retry: {}",
                        self.timings.poll_retry,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.timings.poll_retry) => {}
                    }
                }
            }
        }
    }

    /// Acknowledge a message. Returns whether the service accepted it.
    pub async fn delete_message(&self, message: &TaskAgentMessage) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        match self.service.delete_message(session_id, message.message_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to delete message {}: {}", message.message_id, e);
                false
            }
        }
    }

    /// Delete the live session (best effort) and forget it.
    pub async fn drop_session(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let session_id = active.session.session_id;
        if let Err(e) = self.service.delete_session(&session_id).await {
            tracing::warn!("Failed to delete active session: {}", e);
        }
        self.forget(&session_id).await;
    }

    async fn forget(&self, session_id: &str) {
        if let Err(e) = self.state.remove(session_id).await {
            tracing::warn!("Failed to update sessions.json: {}", e);
        }
    }

    /// Make sure a fresh session exists. `Ok(false)` when cancelled while
    /// waiting to retry.
    async fn ensure_session(&mut self, cancel: &CancellationToken) -> Result<bool, ConnectionError> {
        let stale = self.last_success.elapsed() > self.timings.session_stale_after;
        if self.active.is_some() && !stale {
            return Ok(true);
        }
        if stale && self.active.is_some() {
            tracing::info!("Session of {} went stale, recreating it", self.label);
        }
        self.drop_session().await;

        let mut backoff = Backoff::new(self.timings.backoff_initial, self.timings.backoff_max);
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            match self.open_session().await {
                Ok(active) => {
                    if let Err(e) = self.state.add(active.session.clone()).await {
                        tracing::warn!("Failed to update sessions.json: {}", e);
                    }
                    tracing::info!("Listening for Jobs: {}", self.label);
                    self.active = Some(active);
                    self.last_success = Instant::now();
                    return Ok(true);
                }
                Err(Error::Connection(e)) if e.is_registration_fatal() => {
                    tracing::error!(
                        "Fatal: It seems this runner was removed from GitHub, Failed to recreate Session for {}: {}",
                        self.label,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Failed to recreate Session for {}, waiting {:?} before retry: {}",
                        self.label,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn open_session(&self) -> Result<ActiveSession, Error> {
        let request = TaskAgentSession::request(self.agent.clone());
        let session = self.service.create_session(&request).await?;
        match SessionCipher::derive(&session, &self.key) {
            Ok(cipher) => Ok(ActiveSession { session, cipher }),
            Err(e) => {
                if let Err(delete) = self.service.delete_session(&session.session_id).await {
                    tracing::warn!("Failed to delete unusable session: {}", delete);
                }
                Err(e.into())
            }
        }
    }
}
