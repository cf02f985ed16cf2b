//! Error types for agent365-host.

use thiserror::Error;

/// Result type for agent365-host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for agent365-host.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Chat-completion provider returned an error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// MCP / JSON-RPC protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication or token acquisition failure.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Agent used before `initialize`.
    #[error("agent not initialized")]
    NotInitialized,

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}
