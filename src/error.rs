//! Error taxonomy for the balancer.
//!
//! Configuration errors (`Parse`, `Config`) are fatal to the startup or reload
//! that produced them. Every other variant is local to one connection and is
//! only ever surfaced as a log line and a counter.

use std::net::SocketAddr;
use thiserror::Error;

/// Main balancer error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed address, network or range template.
    #[error("Parse error in '{input}': {reason}")]
    Parse { input: String, reason: String },

    /// Semantically invalid configuration object.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Client rejected by the accept/deny lists or the listener admission limit.
    #[error("Access denied for {client}")]
    AccessDenied { client: String },

    /// A balancing strategy was asked to choose from zero candidates.
    #[error("No candidate backends available")]
    NoCandidate,

    /// A pool could not produce a working backend within its retry budget.
    #[error("Pool '{pool}' exhausted after {attempts} attempts")]
    Exhausted { pool: String, attempts: usize },

    /// One backend's transport connect attempt failed.
    #[error("Connect to backend {backend} failed: {reason}")]
    ConnectFailure { backend: SocketAddr, reason: String },

    /// An established session failed or timed out after forwarding began.
    #[error("Exchange error: {message}")]
    Exchange { message: String },

    #[error("Failed to bind to address '{address}': {reason}")]
    Bind { address: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for balancer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Admission,
    Capacity,
    Backend,
    Session,
    Io,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl Error {
    pub fn parse<I: Into<String>, R: Into<String>>(input: I, reason: R) -> Self {
        Error::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn exchange<S: Into<String>>(message: S) -> Self {
        Error::Exchange {
            message: message.into(),
        }
    }

    pub fn access_denied<S: ToString>(client: S) -> Self {
        Error::AccessDenied {
            client: client.to_string(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Parse { .. } | Error::Config { .. } | Error::Bind { .. } => {
                ErrorCategory::Configuration
            }
            Error::AccessDenied { .. } => ErrorCategory::Admission,
            Error::NoCandidate | Error::Exhausted { .. } => ErrorCategory::Capacity,
            Error::ConnectFailure { .. } => ErrorCategory::Backend,
            Error::Exchange { .. } => ErrorCategory::Session,
            Error::Io(_) => ErrorCategory::Io,
        }
    }

    /// Status code returned to HTTP clients for this error.
    ///
    /// Every outcome is a server error: a rejected client learns nothing
    /// about why it was rejected.
    pub fn http_status_code(&self) -> u16 {
        match self {
            Error::NoCandidate | Error::Exhausted { .. } => 503,
            Error::ConnectFailure { .. } | Error::Exchange { .. } => 502,
            _ => 500,
        }
    }

    /// Get the log level for this error
    pub fn log_level(&self) -> LogLevel {
        match self {
            Error::Parse { .. } | Error::Config { .. } | Error::Bind { .. } => LogLevel::Error,
            Error::NoCandidate | Error::Exhausted { .. } => LogLevel::Warn,
            Error::ConnectFailure { .. } | Error::Io(_) => LogLevel::Warn,
            Error::Exchange { .. } => LogLevel::Info,
            Error::AccessDenied { .. } => LogLevel::Debug,
        }
    }
}
