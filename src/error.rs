//! Error types for mail-configure

use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Configuration already in progress")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Provider-level failure class reported with an `Error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The server rejected the login.
    AuthFailed,
    /// No candidate server could be reached.
    Unreachable,
    /// TLS setup or handshake failed.
    Tls,
    /// The server answered with something unexpected.
    Protocol,
    /// The controller is flagged offline.
    Offline,
    /// Settings were negotiated but could not be persisted.
    Storage,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "auth-failed",
            Self::Unreachable => "unreachable",
            Self::Tls => "tls",
            Self::Protocol => "protocol",
            Self::Offline => "offline",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed negotiation attempt. Never returned to the caller of
/// `configure`; it is delivered as an `Error` event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct NegotiationError {
    pub code: ErrorCode,
    pub message: String,
}

impl NegotiationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
