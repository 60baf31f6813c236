//! Error types for the envelope codec.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("invalid signing key")]
    InvalidKey,
}

pub type Result<T> = std::result::Result<T, CodecError>;
