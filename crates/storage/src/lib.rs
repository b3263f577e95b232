//! Chunked object storage on top of chat attachment hosting.
//!
//! This crate provides:
//! - A rate-limited REST transport rotating over credentials and channels
//! - Sequential and parallel chunked writers
//! - A seekable chunked reader
//! - Expiry refresh of signed attachment URLs, serialized per file

pub mod driver;
pub mod error;
pub mod locker;
pub mod pool;
pub mod ratelimit;
pub mod reader;
pub mod refresh;
pub mod rest;
pub mod traits;
pub mod writer;

pub use driver::{Driver, DriverOptions};
pub use error::{StorageError, StorageResult};
pub use locker::{KeyGuard, LockRegistry};
pub use pool::RoundRobin;
pub use ratelimit::{Permit, QuotaHeaders, RateLimiter};
pub use reader::ChunkReader;
pub use refresh::refresh_expired;
pub use rest::RestTransport;
pub use traits::{ByteStream, Direction, MESSAGE_PAGE_SIZE, Transport};
pub use writer::{
    ChunkReceiver, ChunkUpload, ChunkWriter, ParallelWriter, SequentialWriter, copy_into,
};
