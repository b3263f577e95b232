//! Driver facade consumed by metadata catalogs.

use crate::error::{StorageError, StorageResult};
use crate::locker::LockRegistry;
use crate::reader::ChunkReader;
use crate::refresh::refresh_expired;
use crate::rest::RestTransport;
use crate::traits::Transport;
use crate::writer::{ChunkReceiver, ChunkWriter, ParallelWriter, SequentialWriter};
use relaydrive_core::{DriverConfig, Node};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Writer and pool settings of a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverOptions {
    pub chunk_size: u64,
    pub async_write: bool,
    pub upload_concurrency: usize,
}

impl DriverOptions {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            async_write: config.async_write,
            upload_concurrency: config.upload_concurrency(),
        }
    }
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            chunk_size: relaydrive_core::DEFAULT_CHUNK_SIZE,
            async_write: false,
            upload_concurrency: 1,
        }
    }
}

/// Chunked object store on top of a [`Transport`].
pub struct Driver {
    transport: Arc<dyn Transport>,
    options: DriverOptions,
    locks: LockRegistry,
    cancel: CancellationToken,
}

impl Driver {
    /// Create a driver talking to the origin's REST API.
    ///
    /// The configuration is validated by [`RestTransport::new`].
    pub fn new(config: &DriverConfig) -> StorageResult<Self> {
        let cancel = CancellationToken::new();
        let transport = RestTransport::new(config, cancel.clone())?;
        tracing::info!(
            tokens = config.tokens.len(),
            channels = config.channels.len(),
            chunk_size = config.chunk_size,
            async_write = config.async_write,
            "storage driver ready"
        );
        Ok(Self {
            transport: Arc::new(transport),
            options: DriverOptions::from_config(config),
            locks: LockRegistry::new(),
            cancel,
        })
    }

    /// Create a driver over an arbitrary transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        options: DriverOptions,
    ) -> StorageResult<Self> {
        if !(relaydrive_core::MIN_CHUNK_SIZE..=relaydrive_core::MAX_CHUNK_SIZE)
            .contains(&options.chunk_size)
        {
            return Err(relaydrive_core::Error::InvalidChunkSize {
                size: options.chunk_size,
                min: relaydrive_core::MIN_CHUNK_SIZE,
                max: relaydrive_core::MAX_CHUNK_SIZE,
            }
            .into());
        }
        Ok(Self {
            transport,
            options,
            locks: LockRegistry::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn chunk_size(&self) -> usize {
        // Bounded by MAX_CHUNK_SIZE at construction.
        self.options.chunk_size as usize
    }

    /// Writer uploading chunks inline.
    pub fn new_writer(&self) -> (SequentialWriter, ChunkReceiver) {
        SequentialWriter::new(Arc::clone(&self.transport), self.chunk_size())
    }

    /// Writer uploading full chunks concurrently.
    pub fn new_parallel_writer(&self) -> (ParallelWriter, ChunkReceiver) {
        ParallelWriter::new(
            Arc::clone(&self.transport),
            self.chunk_size(),
            self.options.upload_concurrency,
        )
    }

    /// The writer selected by the `async_write` setting.
    pub fn writer(&self) -> (Box<dyn ChunkWriter>, ChunkReceiver) {
        if self.options.async_write {
            let (writer, receiver) = self.new_parallel_writer();
            (Box::new(writer), receiver)
        } else {
            let (writer, receiver) = self.new_writer();
            (Box::new(writer), receiver)
        }
    }

    /// Reader over `nodes`, positioned at `start`.
    pub fn new_reader(&self, nodes: Vec<Node>, start: u64) -> StorageResult<ChunkReader> {
        ChunkReader::new(Arc::clone(&self.transport), nodes, start)
    }

    /// Re-sign the expired records of one file.
    ///
    /// Refreshes of the same `file_id` never run concurrently. Returns the
    /// number of records rewritten.
    pub async fn update_nodes(&self, file_id: &str, nodes: &mut [Node]) -> StorageResult<usize> {
        let _guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
            guard = self.locks.lock(file_id) => guard,
        };
        refresh_expired(self.transport.as_ref(), nodes, relaydrive_core::unix_now()).await
    }

    /// Abort limiter waits, retry loops and pending refreshes.
    pub fn shutdown(&self) {
        tracing::info!("storage driver shutting down");
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
