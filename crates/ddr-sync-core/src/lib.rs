//! Core types, configuration, and cache primitives for DDR repository sync
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - Error taxonomy shared by the scheduler and the web process
//! - DDR identifier parsing
//! - The shared key/value `CacheStore` (in-memory and file-backed)
//! - Lock-free metrics counters

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod error;
pub mod identifier;
pub mod metrics;

// Re-export key types for convenience
pub use cache::{CacheStore, FileCache, MemoryCache};
pub use config::{Config, ttl_from_secs};
pub use error::{Error, Result};
pub use identifier::{Identifier, IdentifierKind};
pub use metrics::global_metrics;
