//! Persisted runner configuration (`settings.json`) and the JSON file
//! helpers shared by the other state files.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SettingsError;
use crate::protocol::agent::{GitHubAuthResult, TaskAgent};

/// One configured agent registration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerInstance {
    pub pool_id: i64,
    pub registration_url: String,
    pub auth: Option<GitHubAuthResult>,
    pub agent: Option<TaskAgent>,
    /// Base64 PKCS#1 DER private key.
    pub key: String,
    #[serde(skip)]
    pub private_key: Option<RsaPrivateKey>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub runner_guard: String,
}

impl std::fmt::Debug for RunnerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerInstance")
            .field("pool_id", &self.pool_id)
            .field("registration_url", &self.registration_url)
            .field("agent", &self.name())
            .field("runner_guard", &self.runner_guard)
            .finish()
    }
}

impl RunnerInstance {
    pub fn name(&self) -> &str {
        self.agent.as_ref().map(|a| a.name.as_str()).unwrap_or("")
    }

    pub fn is_ephemeral(&self) -> bool {
        self.agent.as_ref().is_some_and(|a| a.ephemeral)
    }

    pub fn tenant_url(&self) -> &str {
        self.auth.as_ref().map(|a| a.tenant_url.as_str()).unwrap_or("")
    }

    /// Store `key` both decoded and in its persisted form.
    pub fn set_private_key(&mut self, key: RsaPrivateKey) -> Result<(), SettingsError> {
        let der = key.to_pkcs1_der().map_err(|e| SettingsError::PrivateKey {
            name: self.name().to_string(),
            reason: e.to_string(),
        })?;
        self.key = STANDARD.encode(der.as_bytes());
        self.private_key = Some(key);
        Ok(())
    }

    /// Decode `key` into `private_key`.
    pub fn decode_private_key(&mut self) -> Result<(), SettingsError> {
        let invalid = |reason: String| SettingsError::PrivateKey {
            name: self.name().to_string(),
            reason,
        };
        let der = STANDARD
            .decode(self.key.trim())
            .map_err(|e| invalid(e.to_string()))?;
        let key = RsaPrivateKey::from_pkcs1_der(&der).map_err(|e| invalid(e.to_string()))?;
        self.private_key = Some(key);
        Ok(())
    }

    /// Agent descriptor and key, the two things a worker cannot run without.
    pub fn credentials(&self) -> Result<(&TaskAgent, &RsaPrivateKey), SettingsError> {
        match (self.agent.as_ref(), self.private_key.as_ref()) {
            (Some(agent), Some(key)) => Ok((agent, key)),
            _ => Err(SettingsError::NotConfigured),
        }
    }
}

/// All configured instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub pool_id: i64,
    pub registration_url: String,
    pub instances: Vec<RunnerInstance>,
}

impl RunnerSettings {
    /// Load settings and decode every instance key. A missing file yields
    /// empty settings.
    pub async fn load(path: &Path) -> Result<Self, SettingsError> {
        let mut settings: RunnerSettings = read_json(path).await?.unwrap_or_default();
        for instance in &mut settings.instances {
            instance.decode_private_key()?;
        }
        Ok(settings)
    }

    pub async fn save(&self, path: &Path) -> Result<(), SettingsError> {
        write_json(path, self).await
    }

    /// Exactly one instance, and it is ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.instances.len() == 1 && self.instances[0].is_ephemeral()
    }
}

/// Read a JSON file. Keys written by older versions in PascalCase are
/// normalised to camelCase first. `Ok(None)` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SettingsError> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let json = |source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    };
    let value: Value = serde_json::from_str(&data).map_err(json)?;
    serde_json::from_value(normalize_keys(value)).map(Some).map_err(json)
}

/// Write `value` as pretty JSON, readable only by the owner.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SettingsError> {
    let io = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }

    let json = serde_json::to_string_pretty(value).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tokio::fs::write(path, json).await.map_err(io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io)?;
    }

    tracing::debug!("Saved {}", path.display());
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file(path: &Path) -> Result<(), SettingsError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SettingsError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Recursively rewrite object keys from PascalCase to camelCase
/// (`PoolId` → `poolId`, `OSDescription` → `osDescription`, `IV` → `iv`).
/// Keys that already start lowercase are left alone.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (camel_case(&k), normalize_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

fn camel_case(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let upper_run = chars.iter().take_while(|c| c.is_ascii_uppercase()).count();
    let lower = match upper_run {
        0 => return key.to_string(),
        n if n == chars.len() => n,
        1 => 1,
        // `OSDescription`: the last capital starts the next word.
        n => n - 1,
    };
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| if i < lower { c.to_ascii_lowercase() } else { *c })
        .collect()
}
