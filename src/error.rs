//! Error types for dune-poll.
//!
//! Defines the main error enum used throughout the application.

use thiserror::Error;

/// Main error type for dune-poll operations.
#[derive(Error, Debug)]
pub enum DuneError {
    /// Configuration errors (missing API key, invalid intervals, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport errors (connection refused, timeouts, TLS failures, etc.)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success responses from the query API.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Responses that could not be decoded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The run was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// The overall deadline elapsed before the query completed.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Every submission attempt ended in a non-progress state.
    #[error("Gave up after {attempts} attempt(s); last state was {last_state}")]
    RetriesExhausted { attempts: u32, last_state: String },

    /// Writing or reading result files failed.
    #[error("Output error: {0}")]
    Output(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DuneError {
    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a transport error with the given message.
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Creates an API error for the given HTTP status.
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: msg.into(),
        }
    }

    /// Creates a parse error with the given message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Creates an output error with the given message.
    pub fn output(msg: impl Into<String>) -> Self {
        Self::Output(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "Configuration Error",
            Self::Http(_) => "HTTP Error",
            Self::Api { .. } => "API Error",
            Self::Parse(_) => "Parse Error",
            Self::Cancelled => "Cancelled",
            Self::Timeout(_) => "Timeout",
            Self::RetriesExhausted { .. } => "Retries Exhausted",
            Self::Output(_) => "Output Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true for failures that a later request may not hit again.
    ///
    /// Used by the HTTP client to decide whether to retry a single call.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias using DuneError.
pub type Result<T> = std::result::Result<T, DuneError>;
