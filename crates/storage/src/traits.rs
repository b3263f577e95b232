//! Transport trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use relaydrive_core::{Message, Node};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Number of messages one history page returns.
pub const MESSAGE_PAGE_SIZE: usize = 100;

/// Which side of the anchor message a history page covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Before,
    After,
    Around,
}

impl Direction {
    /// Query parameter name understood by the origin.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Around => "around",
        }
    }
}

/// The primitives chunked writers, readers and refresh are built on.
///
/// Implementations absorb retryable failures (rate limits, server errors)
/// and only surface errors the caller has to act on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload one chunk as a message attachment.
    ///
    /// The returned record carries the freshly signed URL and the id of the
    /// hosting message.
    async fn upload_attachment(&self, data: Bytes) -> StorageResult<Node>;

    /// Stream bytes `start..=end` of a chunk.
    async fn range_fetch(&self, node: &Node, start: u64, end: u64) -> StorageResult<ByteStream>;

    /// Fetch up to [`MESSAGE_PAGE_SIZE`] messages of `channel` next to `anchor`.
    async fn list_messages(
        &self,
        channel: &str,
        anchor: u64,
        direction: Direction,
    ) -> StorageResult<Vec<Message>>;

    /// Transport name, for logging.
    fn transport_name(&self) -> &'static str;
}
