//! Chunked reader.
//!
//! Presents an ordered list of chunk records as one seekable byte stream.
//! Each read resolves the chunk owning the current position through a
//! cumulative offset table and streams the rest of that chunk with a
//! ranged fetch, moving on to the next chunk at its boundary.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, Transport};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use relaydrive_core::Node;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

enum ReadState {
    Idle,
    Opening {
        fetch: BoxFuture<'static, StorageResult<ByteStream>>,
        remaining: u64,
    },
    Streaming {
        stream: ByteStream,
        pending: Bytes,
        /// Bytes of the current chunk not yet handed out.
        remaining: u64,
    },
}

/// Chunk records and where each one starts in the file.
struct Layout {
    nodes: Vec<Node>,
    offsets: Vec<u64>,
    size: u64,
}

impl Layout {
    fn new(nodes: Vec<Node>) -> StorageResult<Self> {
        let mut offsets = Vec::with_capacity(nodes.len());
        let mut size = 0u64;
        for node in &nodes {
            offsets.push(size);
            size = size.checked_add(node.size()).ok_or_else(|| {
                StorageError::Protocol(format!(
                    "chunk {} overflows the file size",
                    node.message_id()
                ))
            })?;
        }
        Ok(Self {
            nodes,
            offsets,
            size,
        })
    }

    /// Index of the chunk holding `position`, if any.
    fn locate(&self, position: u64) -> Option<usize> {
        if position >= self.size {
            return None;
        }
        // Last chunk starting at or before the position; skips empty chunks.
        Some(self.offsets.partition_point(|&start| start <= position) - 1)
    }

    async fn read_into(
        &self,
        transport: &dyn Transport,
        buf: &mut [u8],
        offset: u64,
    ) -> StorageResult<usize> {
        let mut filled = 0usize;
        let mut position = offset;
        while filled < buf.len() {
            let Some(index) = self.locate(position) else {
                break;
            };
            let node = &self.nodes[index];
            let start = position - self.offsets[index];
            let want = (node.size() - start).min((buf.len() - filled) as u64);
            let end = start + want - 1;

            let mut stream = transport.range_fetch(node, start, end).await?;
            let mut got = 0u64;
            while got < want {
                let Some(bytes) = stream.next().await else {
                    return Err(short_chunk(node, want - got).into());
                };
                let bytes = bytes?;
                let n = (bytes.len() as u64).min(want - got) as usize;
                buf[filled..filled + n].copy_from_slice(&bytes[..n]);
                filled += n;
                got += n as u64;
            }
            position += want;
        }
        Ok(filled)
    }
}

/// Seekable reader over a chunked file.
pub struct ChunkReader {
    transport: Arc<dyn Transport>,
    layout: Arc<Layout>,
    position: u64,
    state: ReadState,
    closed: bool,
}

impl ChunkReader {
    /// Create a reader positioned at `start`.
    ///
    /// Fails with [`StorageError::InvalidOffset`] when `start` lies beyond
    /// the end of the file.
    pub fn new(transport: Arc<dyn Transport>, nodes: Vec<Node>, start: u64) -> StorageResult<Self> {
        let layout = Layout::new(nodes)?;
        if start > layout.size {
            return Err(StorageError::InvalidOffset {
                offset: start,
                size: layout.size,
            });
        }

        Ok(Self {
            transport,
            layout: Arc::new(layout),
            position: start,
            state: ReadState::Idle,
            closed: false,
        })
    }

    /// Total size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.layout.size
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read into `buf` starting at `offset` without moving the cursor.
    ///
    /// Fills `buf` completely unless the end of the file comes first. The
    /// returned future does not borrow the reader.
    pub fn read_at<'a>(
        &self,
        buf: &'a mut [u8],
        offset: u64,
    ) -> impl Future<Output = StorageResult<usize>> + Send + use<'a> {
        let transport = Arc::clone(&self.transport);
        let layout = Arc::clone(&self.layout);
        let closed = self.closed;
        async move {
            if closed {
                return Err(StorageError::Closed);
            }
            layout.read_into(transport.as_ref(), buf, offset).await
        }
    }

    /// Drop any in-flight fetch and refuse further reads.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::AlreadyClosed);
        }
        self.closed = true;
        self.state = ReadState::Idle;
        Ok(())
    }
}

fn short_chunk(node: &Node, missing: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "chunk of message {} ended {missing} bytes early",
            node.message_id()
        ),
    )
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(StorageError::Closed.into()));
        }

        loop {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            match &mut this.state {
                ReadState::Idle => {
                    let Some(index) = this.layout.locate(this.position) else {
                        return Poll::Ready(Ok(()));
                    };
                    let node = this.layout.nodes[index].clone();
                    let start = this.position - this.layout.offsets[index];
                    let end = node.size() - 1;
                    let transport = Arc::clone(&this.transport);
                    this.state = ReadState::Opening {
                        fetch: Box::pin(
                            async move { transport.range_fetch(&node, start, end).await },
                        ),
                        remaining: end - start + 1,
                    };
                }
                ReadState::Opening { fetch, remaining } => {
                    let remaining = *remaining;
                    match ready!(fetch.as_mut().poll(cx)) {
                        Ok(stream) => {
                            this.state = ReadState::Streaming {
                                stream,
                                pending: Bytes::new(),
                                remaining,
                            };
                        }
                        Err(e) => {
                            this.state = ReadState::Idle;
                            return Poll::Ready(Err(e.into()));
                        }
                    }
                }
                ReadState::Streaming {
                    stream,
                    pending,
                    remaining,
                } => {
                    if *remaining == 0 {
                        this.state = ReadState::Idle;
                        continue;
                    }
                    if !pending.is_empty() {
                        let n = pending
                            .len()
                            .min(buf.remaining())
                            .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                        buf.put_slice(&pending.split_to(n));
                        *remaining -= n as u64;
                        this.position += n as u64;
                        if *remaining == 0 {
                            this.state = ReadState::Idle;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    match ready!(stream.poll_next_unpin(cx)) {
                        Some(Ok(bytes)) => *pending = bytes,
                        Some(Err(e)) => {
                            this.state = ReadState::Idle;
                            return Poll::Ready(Err(e.into()));
                        }
                        None => {
                            let missing = *remaining;
                            this.state = ReadState::Idle;
                            let index = this.layout.locate(this.position).unwrap_or_default();
                            let node = &this.layout.nodes[index];
                            return Poll::Ready(Err(short_chunk(node, missing)));
                        }
                    }
                }
            }
        }
    }
}

impl AsyncSeek for ChunkReader {
    fn start_seek(self: Pin<&mut Self>, target: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if this.closed {
            return Err(StorageError::Closed.into());
        }

        let position = match target {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => this.position.checked_add_signed(delta),
            SeekFrom::End(delta) => this.layout.size.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;

        if position != this.position {
            this.state = ReadState::Idle;
            this.position = position;
        }
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}
