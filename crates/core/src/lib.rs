//! Core domain types for relaydrive.
//!
//! This crate defines the data model shared by the driver and its consumers:
//! - Chunk records (`Node`) and the origin's message shape
//! - The signed attachment URL codec
//! - Driver configuration

pub mod chunk;
pub mod config;
pub mod error;
pub mod signed_url;

pub use chunk::{Attachment, Message, Node};
pub use config::DriverConfig;
pub use error::{Error, Result};
pub use signed_url::SignedUrl;

/// Default chunk size: 24 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 24 * 1024 * 1024;

/// Maximum chunk size: 25 MiB (the origin's attachment cap)
pub const MAX_CHUNK_SIZE: u64 = 25 * 1024 * 1024;

/// Minimum chunk size: 1 byte
pub const MIN_CHUNK_SIZE: u64 = 1;

/// Current unix time in seconds, the clock signed URLs are checked against.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
