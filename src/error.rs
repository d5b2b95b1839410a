//! Error taxonomy for calls that leave the process
//!
//! Every collaborator (GitHub, git, the local filesystem during an attempt)
//! reports failures as a [`CallError`]. The retry policy only looks at
//! [`CallError::class`] to decide whether another attempt is worthwhile.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification used by the retry policy and the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limit, network blip, server-side 5xx, git transport hiccup.
    TransientExternal,
    /// Authentication, not-found, malformed request.
    TerminalExternal,
    /// Disk I/O while cloning, writing or staging.
    LocalResource,
    /// The operator asked the run to stop.
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("git {operation} failed: {message}")]
    Git {
        operation: &'static str,
        message: String,
        transient: bool,
    },

    #[error("local I/O error: {0}")]
    Local(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{label} gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        label: String,
        attempts: u32,
        last: Box<CallError>,
    },
}

impl CallError {
    /// Map an HTTP status and (already sanitized) body to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => CallError::RateLimited {
                message,
                retry_after: None,
            },
            // GitHub reports secondary rate limits as 403 with an explanatory body.
            403 if message.to_ascii_lowercase().contains("rate limit") => {
                CallError::RateLimited {
                    message,
                    retry_after: None,
                }
            }
            401 | 403 => CallError::Unauthorized(message),
            404 => CallError::NotFound(message),
            500..=599 => CallError::Server { status, message },
            _ => CallError::Rejected { status, message },
        }
    }

    pub fn git(operation: &'static str, message: impl Into<String>, transient: bool) -> Self {
        CallError::Git {
            operation,
            message: message.into(),
            transient,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CallError::RateLimited { .. } | CallError::Network(_) | CallError::Server { .. } => {
                ErrorClass::TransientExternal
            }
            CallError::Git { transient, .. } => {
                if *transient {
                    ErrorClass::TransientExternal
                } else {
                    ErrorClass::TerminalExternal
                }
            }
            CallError::Unauthorized(_)
            | CallError::NotFound(_)
            | CallError::Rejected { .. }
            | CallError::Decode(_)
            | CallError::Exhausted { .. } => ErrorClass::TerminalExternal,
            CallError::Local(_) => ErrorClass::LocalResource,
            CallError::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientExternal
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return CallError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return CallError::from_status(status.as_u16(), err.to_string());
        }
        CallError::Network(err.to_string())
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        CallError::Local(err.to_string())
    }
}

impl From<git2::Error> for CallError {
    fn from(err: git2::Error) -> Self {
        let transient = matches!(
            err.class(),
            git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssl
        );
        if matches!(
            err.class(),
            git2::ErrorClass::Os | git2::ErrorClass::Filesystem | git2::ErrorClass::Index
        ) {
            return CallError::Local(err.message().to_string());
        }
        CallError::git("operation", err.message().to_string(), transient)
    }
}
