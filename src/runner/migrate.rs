//! One-time migration of state written by older versions.
//!
//! - `session.json` (single session) is appended to `sessions.json`.
//! - `agent.json` + `auth.json` + `cred.pkcs1` become one instance in
//!   `settings.json`.
//!
//! Legacy files are deleted once their content is saved in the new format.

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;

use crate::config::StatePaths;
use crate::error::SettingsError;
use crate::protocol::agent::{GitHubAuthResult, TaskAgent};
use crate::protocol::session::TaskAgentSession;
use crate::runner::settings::{self, RunnerInstance, RunnerSettings, read_json, remove_file, write_json};

/// What the migration did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub session: bool,
    pub instance: bool,
}

pub async fn migrate(paths: &StatePaths) -> Result<MigrationReport, SettingsError> {
    let mut report = MigrationReport::default();

    match read_json::<TaskAgentSession>(&paths.legacy_session).await {
        Ok(Some(session)) => {
            let mut sessions: Vec<TaskAgentSession> = read_json(&paths.sessions)
                .await
                .unwrap_or_default()
                .unwrap_or_default();
            sessions.push(session);
            write_json(&paths.sessions, &sessions).await?;
            if let Err(e) = remove_file(&paths.legacy_session).await {
                tracing::warn!("Cannot delete session.json: {}", e);
            }
            tracing::info!("Migrated session.json to sessions.json");
            report.session = true;
        }
        Ok(None) => {}
        Err(e) => tracing::debug!("session.json is corrupted: {}", e),
    }

    if let Some(legacy) = read_legacy_instance(paths).await {
        let settings_exist = tokio::fs::try_exists(&paths.settings).await.unwrap_or(false);
        let mut settings = RunnerSettings::load(&paths.settings).await?;
        if !settings_exist {
            settings.pool_id = 1;
        }

        let (agent, auth, key) = legacy;
        let mut instance = RunnerInstance {
            pool_id: settings.pool_id,
            registration_url: settings.registration_url.clone(),
            auth: Some(auth),
            agent: Some(agent),
            ..Default::default()
        };
        instance.set_private_key(key)?;
        settings.instances.push(instance);
        settings.save(&paths.settings).await?;

        for path in [&paths.legacy_agent, &paths.legacy_auth, &paths.legacy_key] {
            if let Err(e) = remove_file(path).await {
                tracing::warn!("Cannot delete {}: {}", path.display(), e);
            }
        }
        tracing::info!("Migrated agent.json, auth.json and cred.pkcs1 to settings.json");
        report.instance = true;
    }

    Ok(report)
}

/// All three legacy files, or nothing.
async fn read_legacy_instance(paths: &StatePaths) -> Option<(TaskAgent, GitHubAuthResult, RsaPrivateKey)> {
    let agent: TaskAgent = settings::read_json(&paths.legacy_agent).await.ok()??;
    let auth: GitHubAuthResult = settings::read_json(&paths.legacy_auth).await.ok()??;
    let der = tokio::fs::read(&paths.legacy_key).await.ok()?;
    let key = match RsaPrivateKey::from_pkcs1_der(&der) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!("Ignoring legacy cred.pkcs1: {}", e);
            return None;
        }
    };
    Some((agent, auth, key))
}
