//! Error types for the provisioning pipeline.
//!
//! Every failure crossing into the caller is a [`ProvisionError`]; callers that
//! need a transport-friendly value convert it into a [`Failure`].

use serde::Serialize;
use thiserror::Error;

/// Result type alias for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Coarse classification of a [`ProvisionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Network,
    Device,
    Transport,
    Verification,
    Io,
}

/// Errors that can occur while downloading, verifying, flashing or wiping.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A precondition on caller-supplied input failed.
    #[error("{0}")]
    Validation(String),

    /// The server answered with a non-success status.
    #[error("HTTP error {status}: {message}")]
    Network { status: u16, message: String },

    /// The HTTP request itself failed (DNS, TLS, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No usable port, or the bounded retry protocol ran out of attempts.
    #[error("{message}")]
    Device {
        port: Option<String>,
        message: String,
    },

    /// The programmer could not greet the device on a port.
    #[error("{reason} for {port}")]
    Transport { port: String, reason: String },

    /// Hash or signature did not match.
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error for the cache index or settings file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Release archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl ProvisionError {
    pub fn validation(message: impl Into<String>) -> Self {
        ProvisionError::Validation(message.into())
    }

    pub fn device(port: Option<&str>, message: impl Into<String>) -> Self {
        ProvisionError::Device {
            port: port.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn transport(port: &str, reason: impl Into<String>) -> Self {
        ProvisionError::Transport {
            port: port.to_string(),
            reason: reason.into(),
        }
    }

    /// Map this error onto the provisioning error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Validation(_) => ErrorKind::Validation,
            ProvisionError::Network { .. } | ProvisionError::Http(_) => ErrorKind::Network,
            ProvisionError::Device { .. } | ProvisionError::Serial(_) => ErrorKind::Device,
            ProvisionError::Transport { .. } => ErrorKind::Transport,
            ProvisionError::Verification(_) => ErrorKind::Verification,
            ProvisionError::Io(_) | ProvisionError::Json(_) | ProvisionError::Zip(_) => {
                ErrorKind::Io
            }
        }
    }

    /// Only handshake failures are recovered locally (once, by the port resolver).
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProvisionError::Transport { .. })
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "PRV-001",
            ProvisionError::Network { .. } => "PRV-010",
            ProvisionError::Http(_) => "PRV-011",
            ProvisionError::Device { .. } => "PRV-020",
            ProvisionError::Serial(_) => "PRV-021",
            ProvisionError::Transport { .. } => "PRV-030",
            ProvisionError::Verification(_) => "PRV-040",
            ProvisionError::Io(_) => "PRV-050",
            ProvisionError::Json(_) => "PRV-051",
            ProvisionError::Zip(_) => "PRV-052",
        }
    }

    /// Device path involved in the failure, if any.
    pub fn port(&self) -> Option<&str> {
        match self {
            ProvisionError::Device { port, .. } => port.as_deref(),
            ProvisionError::Transport { port, .. } => Some(port),
            _ => None,
        }
    }

    /// HTTP status involved in the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProvisionError::Network { status, .. } => Some(*status),
            ProvisionError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Structured failure handed to callers: kind, detail, and the offending
/// device path or HTTP status where one applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub detail: String,
    pub port: Option<String>,
    pub status: Option<u16>,
}

impl From<&ProvisionError> for Failure {
    fn from(error: &ProvisionError) -> Self {
        Self {
            kind: error.kind(),
            code: error.error_code(),
            detail: error.to_string(),
            port: error.port().map(str::to_string),
            status: error.status(),
        }
    }
}

impl From<ProvisionError> for Failure {
    fn from(error: ProvisionError) -> Self {
        Failure::from(&error)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.detail)
    }
}
