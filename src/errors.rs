//! # Engine Errors
//!
//! Error types for the synchronization engine.

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    // ==================
    // Configuration Errors
    // ==================
    /// Invalid configuration supplied at the call site
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Topic list was empty or contained an empty name
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Predicate string could not be parsed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    // ==================
    // Connection Errors
    // ==================
    /// Transport-level connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    // ==================
    // Fetch Errors
    // ==================
    /// Range-query failure
    #[error(transparent)]
    Fetch(#[from] FetchError),

    // ==================
    // Lifecycle Errors
    // ==================
    /// Engine task has shut down
    #[error("Engine is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error is a call-site mistake that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_)
                | EngineError::InvalidTopic(_)
                | EngineError::InvalidFilter(_)
                | EngineError::Closed
        )
    }
}

/// Errors produced by a single fetch request
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Transport-level failure reaching the backend
    #[error("HTTP error: {0}")]
    Http(String),

    /// Backend answered with an error envelope
    #[error("Backend error: {0}")]
    Backend(String),

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Request timed out
    #[error("Fetch timeout")]
    Timeout,
}
