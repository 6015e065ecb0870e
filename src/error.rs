use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Quality server error: {0}")]
    QualityServer(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("GitHub API error: {0}")]
    GitHubApi(String),

    #[error("Upstream API error: {0}")]
    Api(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Build an error from a non-success HTTP status returned by `service`.
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let detail = format!("{service} returned {status}: {body}");
        match status {
            429 => AppError::RateLimited(detail),
            401 | 403 => AppError::Unauthorized(detail),
            404 => AppError::NotFound(detail),
            408 | 500..=599 => AppError::Unavailable(detail),
            _ => AppError::Api(detail),
        }
    }

    /// Classify this error for the retry supervisor.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::RateLimited(_) | AppError::Unavailable(_) => ErrorKind::Transient,
            AppError::InvalidInput(_) | AppError::Config(_) => ErrorKind::Precondition,
            AppError::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorKind::Transient
                } else {
                    match e.status().map(|s| s.as_u16()) {
                        Some(429 | 408) | Some(500..=599) => ErrorKind::Transient,
                        _ => ErrorKind::Permanent,
                    }
                }
            }
            AppError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            _ => ErrorKind::Permanent,
        }
    }
}

impl From<octocrab::Error> for AppError {
    fn from(e: octocrab::Error) -> Self {
        match &e {
            octocrab::Error::GitHub { source, .. } => {
                AppError::from_status("GitHub", source.status_code.as_u16(), &source.message)
            }
            // Connection refused, DNS failure and client timeouts surface here
            octocrab::Error::Hyper { .. } | octocrab::Error::Service { .. } => {
                AppError::Unavailable(format!("GitHub request failed: {e}"))
            }
            _ => AppError::GitHubApi(e.to_string()),
        }
    }
}

impl From<git2::Error> for AppError {
    fn from(e: git2::Error) -> Self {
        let message = e.message().to_string();
        if e.code() == git2::ErrorCode::Auth {
            return AppError::Unauthorized(message);
        }
        match e.class() {
            // libgit2 only reports the HTTP status inside the message
            git2::ErrorClass::Http if message.contains("401") || message.contains("403") => {
                AppError::Unauthorized(message)
            }
            git2::ErrorClass::Http if message.contains("404") => AppError::NotFound(message),
            git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssl => {
                AppError::Unavailable(message)
            }
            _ => AppError::Git(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Error taxonomy that governs retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Recoverable external failure; retried by the supervisor.
    Transient,
    /// External failure that will not succeed on retry.
    Permanent,
    /// Malformed or missing input.
    Precondition,
    /// Operator-requested stop.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Transient
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Failure returned by a stage handler, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled by operator")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<AppError> for StageError {
    fn from(e: AppError) -> Self {
        StageError::new(e.kind(), e.to_string())
    }
}
