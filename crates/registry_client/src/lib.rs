//! Capability adapter over the external discovery registry.
//!
//! The registry owns service presence, routes, health snapshots, the
//! broadcast channel, and the queue store. This crate exposes those
//! capabilities behind the [`Registry`] trait and implements it against
//! redis, which backs the real registry.

pub mod client;
pub mod error;
pub mod types;

pub use client::{RedisRegistry, Registry, RegistryConfig};
pub use error::{RegistryError, Result};
pub use types::{ApiResponse, NodeEntry, PresenceEntry};
