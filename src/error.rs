use std::io;
use std::time::Duration;

/// Failures surfaced by sessions, the supervisor, and the router.
///
/// Transport-level protocol damage (`MalformedFrame`) terminates the session
/// it occurred on; `Timeout` and `SessionClosed` are returned to the specific
/// caller and may be retried against a fresh session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("executable `{0}` not found on PATH")]
    BinaryNotFound(String),

    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("backend does not support `{0}`")]
    MethodNotFound(String),

    #[error("session closed before a response arrived")]
    SessionClosed,

    #[error("backend `{0}` crashed: {1}")]
    BackendCrashed(String, String),

    #[error("backend error {code}: {message}")]
    Backend { code: i64, message: String },

    #[error("invalid config `{name}`: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
