//! Error types for the runner agent.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Errors talking to the orchestration service.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Non-2xx response after the optional re-authorization retry.
    #[error(
        "request {method} {url} failed with status {status}, requestBody: `{request_body}` and responseBody: `{response_body}`"
    )]
    Status {
        method: String,
        url: String,
        status: u16,
        request_body: String,
        response_body: String,
    },

    /// A response body was expected but the service answered without one
    /// (any 2xx other than 200). Long-poll callers treat this as "empty".
    #[error("no content")]
    NoContent,

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to Authorize: {reason}")]
    Authorization { reason: String },

    #[error("Service definition {0} not found in connection data")]
    UnknownService(String),

    #[error("Connection data has not been fetched yet")]
    MissingConnectionData,

    #[error("Invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// The service responded with an empty body where one was expected.
    pub fn is_no_content(&self) -> bool {
        matches!(self, ConnectionError::NoContent)
    }

    /// The agent registration is gone; retrying cannot help.
    pub fn is_registration_fatal(&self) -> bool {
        let text = self.to_string();
        text.contains("invalid_client") || text.contains("TaskAgentNotFoundException")
    }

    /// The session is no longer usable and has to be recreated.
    pub fn is_session_invalid(&self) -> bool {
        let text = self.to_string();
        text.contains("TaskAgentSessionExpiredException") || text.contains("AccessDeniedException")
    }

    /// 401/400 answers, which trigger a single re-authorization.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ConnectionError::Status { status: 400 | 401, .. })
    }
}

/// Errors deriving the symmetric session cipher.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("Failed to decrypt session key: {0}")]
    KeyDecryption(#[from] rsa::Error),

    #[error("Unsupported session key length {0}, expected 16, 24 or 32 bytes")]
    KeyLength(usize),
}

/// Errors reading or writing persisted agent state.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is corrupted: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid private key for runner {name}: {reason}")]
    PrivateKey { name: String, reason: String },

    #[error("The runner needs to be configured first")]
    NotConfigured,
}

/// Errors turning a queued message into a running job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message {message_id} has an invalid encoding: {reason}")]
    Encoding { message_id: i64, reason: String },

    #[error("Failed to decrypt message {message_id}: {reason}")]
    Decrypt { message_id: i64, reason: String },

    #[error("Failed to parse job request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid job request: {0}")]
    InvalidJob(String),

    #[error("A job is already running on this runner")]
    Busy,

    #[error("Received a second job, but running in run once mode")]
    SecondJobInRunOnce,
}

/// Errors surfaced by a job executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Job execution failed: {reason}")]
    Failed { reason: String },

    #[error("The worker panicked with message: {message}\n{backtrace}")]
    Panicked { message: String, backtrace: String },

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, Error>;
