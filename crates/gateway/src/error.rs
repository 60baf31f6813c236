//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Registry adapter failure.
    #[error("registry error: {0}")]
    Registry(#[from] registry_client::RegistryError),

    /// Envelope codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] common::CodecError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound HTTP error (external routes).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Route pattern failed to compile.
    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),

    /// Client not found.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// Channel send error.
    #[error("channel send error")]
    ChannelSend,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl From<tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
