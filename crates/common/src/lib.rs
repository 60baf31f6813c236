//! Shared types for the gateway: the UMF envelope codec and common errors.

pub mod error;
pub mod umf;

pub use error::{CodecError, Result};
pub use umf::{short_id, UmfMessage, UmfRoute, UMF_VERSION};
