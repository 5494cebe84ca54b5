//! Runtime configuration for the agent.
//!
//! Values come from the environment (after `.env` is loaded) and are then
//! overridden by command line flags in `main.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding settings, sessions and the job marker.
    pub dir: PathBuf,
    /// Exit after the first job.
    pub once: bool,
    /// Log HTTP request and response bodies.
    pub trace: bool,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    pub timings: ProtocolTimings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            once: false,
            trace: false,
            http_timeout: Duration::from_secs(100),
            timings: ProtocolTimings::default(),
        }
    }
}

impl AgentConfig {
    /// Build a config from `RUNNER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("RUNNER_DIR")
            && !dir.is_empty()
        {
            config.dir = PathBuf::from(dir);
        }
        config.once = env_flag("RUNNER_ONCE");
        config.trace = env_flag("RUNNER_TRACE");
        if let Some(secs) = std::env::var("RUNNER_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.http_timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_timings(mut self, timings: ProtocolTimings) -> Self {
        self.timings = timings;
        self
    }

    /// File locations derived from `dir`.
    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.dir)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Paths of every file the agent persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub settings: PathBuf,
    pub sessions: PathBuf,
    pub job_run: PathBuf,
    pub legacy_session: PathBuf,
    pub legacy_agent: PathBuf,
    pub legacy_auth: PathBuf,
    pub legacy_key: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            settings: dir.join("settings.json"),
            sessions: dir.join("sessions.json"),
            job_run: dir.join("jobrun.json"),
            legacy_session: dir.join("session.json"),
            legacy_agent: dir.join("agent.json"),
            legacy_auth: dir.join("auth.json"),
            legacy_key: dir.join("cred.pkcs1"),
        }
    }
}

/// Every wait, retry count and size used by the protocol engine.
#[derive(Debug, Clone)]
pub struct ProtocolTimings {
    /// A session without a successful exchange for this long is recreated.
    pub session_stale_after: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Wait after a transient poll error.
    pub poll_retry: Duration,
    pub finish_attempts: u32,
    pub finish_interval: Duration,
    pub timeline_attempts: u32,
    pub timeline_interval: Duration,
    pub renew_interval: Duration,
    pub log_window: Duration,
    pub log_channel_capacity: usize,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            session_stale_after: Duration::from_secs(5 * 60),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(600),
            poll_retry: Duration::from_secs(10),
            finish_attempts: 10,
            finish_interval: Duration::from_secs(10),
            timeline_attempts: 10,
            timeline_interval: Duration::from_secs(10),
            renew_interval: Duration::from_secs(60),
            log_window: Duration::from_secs(1),
            log_channel_capacity: 64,
        }
    }
}
