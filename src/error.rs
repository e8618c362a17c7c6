//! The error taxonomy shared by every module (SPEC_FULL.md §7).

use thiserror::Error;

/// Top-level error type returned by the engine's fallible operations.
///
/// Per-channel and per-connection errors never abort the server; this type
/// exists so handlers have something concrete to log and, where relevant,
/// turn into a negative reply or a non-zero exit status.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("authentication denied for {user}")]
    AuthDenied { user: String },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unsupported channel type: {0}")]
    UnsupportedChannelType(String),

    #[error("unsupported subsystem: {0}")]
    UnsupportedSubsystem(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("request already replied to")]
    AlreadyReplied,

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("ssh key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("sftp error: {0}")]
    Sftp(String),
}

impl From<russh_sftp::protocol::StatusCode> for ServerError {
    fn from(code: russh_sftp::protocol::StatusCode) -> Self {
        ServerError::Sftp(format!("{code:?}"))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
