//! Session list shared by every worker in the process.
//!
//! All read-modify-write-persist sequences run under one mutex so that
//! concurrent workers never lose each other's updates to `sessions.json`.

use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::error::SettingsError;
use crate::protocol::agent::TaskAgent;
use crate::protocol::session::TaskAgentSession;
use crate::runner::settings::{read_json, write_json};

pub struct AgentState {
    sessions_path: PathBuf,
    sessions: Mutex<Vec<TaskAgentSession>>,
}

impl AgentState {
    pub fn new(sessions_path: impl Into<PathBuf>, sessions: Vec<TaskAgentSession>) -> Self {
        Self {
            sessions_path: sessions_path.into(),
            sessions: Mutex::new(sessions),
        }
    }

    /// Load `sessions.json`. A missing or corrupted file starts empty.
    pub async fn load(sessions_path: impl Into<PathBuf>) -> Self {
        let sessions_path = sessions_path.into();
        let sessions = match read_json::<Vec<TaskAgentSession>>(&sessions_path).await {
            Ok(sessions) => sessions.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("sessions.json is corrupted: {}", e);
                Vec::new()
            }
        };
        Self::new(sessions_path, sessions)
    }

    /// Persisted sessions owned by `agent`.
    pub async fn sessions_for(&self, agent: &TaskAgent) -> Vec<TaskAgentSession> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|s| s.belongs_to(agent))
            .cloned()
            .collect()
    }

    /// Remove and return every session owned by `agent`.
    pub async fn take_sessions_for(&self, agent: &TaskAgent) -> Result<Vec<TaskAgentSession>, SettingsError> {
        let mut sessions = self.sessions.lock().await;
        let (taken, kept): (Vec<_>, Vec<_>) = sessions.drain(..).partition(|s| s.belongs_to(agent));
        *sessions = kept;
        if !taken.is_empty() {
            write_json(&self.sessions_path, &*sessions).await?;
        }
        Ok(taken)
    }

    pub async fn add(&self, session: TaskAgentSession) -> Result<(), SettingsError> {
        let mut sessions = self.sessions.lock().await;
        sessions.push(session);
        write_json(&self.sessions_path, &*sessions).await
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), SettingsError> {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|s| s.session_id != session_id);
        if sessions.len() != before {
            write_json(&self.sessions_path, &*sessions).await?;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
