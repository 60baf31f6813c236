//! Registry adapter error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("codec error: {0}")]
    Codec(#[from] common::CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no {0} instances available")]
    NoInstance(String),

    #[error("inbound channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, RegistryError>;
