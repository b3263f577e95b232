//! Chunked writers.
//!
//! A writer slices an incoming byte stream into pieces of at most
//! `chunk_size` bytes and uploads each piece as one attachment. Every
//! uploaded chunk is delivered on the writer's result channel as a
//! [`ChunkUpload`]; the catalog consuming the channel owns the records.
//!
//! Writers are not cancel safe: dropping a pending `write` or `close` may
//! lose the chunk being uploaded.

use crate::error::{StorageError, StorageResult};
use crate::traits::Transport;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relaydrive_core::Node;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};

/// Read buffer size used by [`copy_into`].
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// One uploaded chunk, tagged with its position in the written stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkUpload {
    /// 0-based index of the chunk in the written byte stream.
    pub sequence: u64,
    pub node: Node,
}

/// Receiving end of a writer's result channel.
pub type ChunkReceiver = mpsc::UnboundedReceiver<ChunkUpload>;

/// Sink splitting a byte stream into uploaded chunks.
#[async_trait]
pub trait ChunkWriter: Send {
    /// Accept `data`, uploading every chunk it completes.
    ///
    /// Returns the number of bytes accepted, which is always `data.len()`.
    async fn write(&mut self, data: &[u8]) -> StorageResult<usize>;

    /// Upload the remainder and finish the stream.
    async fn close(&mut self) -> StorageResult<()>;

    /// Total bytes accepted so far.
    fn bytes_written(&self) -> u64;
}

/// Stream all of `reader` into `writer`. Does not close the writer.
pub async fn copy_into<R>(reader: &mut R, writer: &mut dyn ChunkWriter) -> StorageResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        writer.write(&buf[..n]).await?;
        copied += n as u64;
    }
}

/// Accumulator shared by both writers.
#[derive(Debug)]
struct Accumulator {
    chunk_size: usize,
    buffer: BytesMut,
    sequence: u64,
    written: u64,
}

impl Accumulator {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            buffer: BytesMut::new(),
            sequence: 0,
            written: 0,
        }
    }

    /// Copy as much of `data` as fits into the current chunk.
    fn fill(&mut self, data: &[u8]) -> usize {
        if self.buffer.capacity() == 0 {
            self.buffer.reserve(self.chunk_size);
        }
        let take = (self.chunk_size - self.buffer.len()).min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.written += take as u64;
        take
    }

    fn is_full(&self) -> bool {
        self.buffer.len() >= self.chunk_size
    }

    /// Hand out the buffered chunk and its sequence number.
    fn take(&mut self) -> Option<(u64, Bytes)> {
        if self.buffer.is_empty() {
            return None;
        }
        let sequence = self.sequence;
        self.sequence += 1;
        Some((sequence, self.buffer.split().freeze()))
    }
}

/// Writer uploading each chunk inline, in stream order.
pub struct SequentialWriter {
    transport: Arc<dyn Transport>,
    chunks: Accumulator,
    results: mpsc::UnboundedSender<ChunkUpload>,
    closed: bool,
}

impl SequentialWriter {
    pub fn new(transport: Arc<dyn Transport>, chunk_size: usize) -> (Self, ChunkReceiver) {
        let (results, receiver) = mpsc::unbounded_channel();
        let writer = Self {
            transport,
            chunks: Accumulator::new(chunk_size.max(1)),
            results,
            closed: false,
        };
        (writer, receiver)
    }

    async fn flush(&mut self) -> StorageResult<()> {
        let Some((sequence, data)) = self.chunks.take() else {
            return Ok(());
        };
        let size = data.len();
        match self.transport.upload_attachment(data).await {
            Ok(node) => {
                tracing::debug!(sequence, size, message_id = node.message_id(), "chunk stored");
                deliver(&self.results, ChunkUpload { sequence, node });
                Ok(())
            }
            Err(e) => {
                self.closed = true;
                tracing::warn!(sequence, error = %e, "chunk upload failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ChunkWriter for SequentialWriter {
    async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let mut rest = data;
        while !rest.is_empty() {
            let taken = self.chunks.fill(rest);
            rest = &rest[taken..];
            if self.chunks.is_full() {
                self.flush().await?;
            }
        }
        Ok(data.len())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::AlreadyClosed);
        }
        let result = self.flush().await;
        self.closed = true;
        result
    }

    fn bytes_written(&self) -> u64 {
        self.chunks.written
    }
}

/// Writer uploading full chunks on a bounded pool of tasks.
///
/// Memory stays below roughly `chunk_size * (concurrency + 1)`. Results may
/// arrive out of stream order; order them by [`ChunkUpload::sequence`].
/// Dropping the writer aborts uploads still in flight.
pub struct ParallelWriter {
    transport: Arc<dyn Transport>,
    chunks: Accumulator,
    results: mpsc::UnboundedSender<ChunkUpload>,
    slots: Arc<Semaphore>,
    uploads: JoinSet<StorageResult<()>>,
    closed: bool,
}

impl ParallelWriter {
    pub fn new(
        transport: Arc<dyn Transport>,
        chunk_size: usize,
        concurrency: usize,
    ) -> (Self, ChunkReceiver) {
        let (results, receiver) = mpsc::unbounded_channel();
        let writer = Self {
            transport,
            chunks: Accumulator::new(chunk_size.max(1)),
            results,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            uploads: JoinSet::new(),
            closed: false,
        };
        (writer, receiver)
    }

    async fn dispatch(&mut self) -> StorageResult<()> {
        let Some((sequence, data)) = self.chunks.take() else {
            return Ok(());
        };
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Closed)?;

        let transport = Arc::clone(&self.transport);
        let results = self.results.clone();
        self.uploads.spawn(async move {
            let _slot = slot;
            let size = data.len();
            let node = transport.upload_attachment(data).await.inspect_err(|e| {
                tracing::warn!(sequence, error = %e, "chunk upload failed");
            })?;
            tracing::debug!(sequence, size, message_id = node.message_id(), "chunk stored");
            deliver(&results, ChunkUpload { sequence, node });
            Ok(())
        });
        Ok(())
    }

    /// Collect uploads that already finished, surfacing the first failure.
    fn reap_finished(&mut self) -> StorageResult<()> {
        while let Some(joined) = self.uploads.try_join_next() {
            if let Err(e) = settle(joined) {
                self.fail();
                return Err(e);
            }
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.closed = true;
        self.uploads.abort_all();
    }
}

#[async_trait]
impl ChunkWriter for ParallelWriter {
    async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.reap_finished()?;

        let mut rest = data;
        while !rest.is_empty() {
            let taken = self.chunks.fill(rest);
            rest = &rest[taken..];
            if self.chunks.is_full() {
                self.dispatch().await?;
                self.reap_finished()?;
            }
        }
        Ok(data.len())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::AlreadyClosed);
        }
        self.closed = true;

        let mut first_error = self.dispatch().await.err();
        while let Some(joined) = self.uploads.join_next().await {
            if let Err(e) = settle(joined) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn bytes_written(&self) -> u64 {
        self.chunks.written
    }
}

fn settle(joined: Result<StorageResult<()>, JoinError>) -> StorageResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(StorageError::Cancelled),
    }
}

fn deliver(results: &mpsc::UnboundedSender<ChunkUpload>, upload: ChunkUpload) {
    if results.send(upload).is_err() {
        tracing::debug!("chunk receiver dropped, discarding record");
    }
}
