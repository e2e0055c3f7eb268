//! Chunk sources, sinks and the data-channel seam

use super::wire::FileChunkMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Data channel of the established connection
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Deliver one chunk; an error counts as a failed attempt
    async fn send_chunk(&self, chunk: FileChunkMessage) -> Result<()>;
}

/// Random-access readable data being sent
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_chunk(&self, offset: u64, size: u64) -> Result<Bytes>;
}

/// Random-access writable destination of a received transfer
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Flush and report the reassembled length
    async fn finish(&self) -> Result<u64>;
}

/// Opens a sink for each newly seen inbound transfer
#[async_trait]
pub trait ChunkSinkFactory: Send + Sync {
    async fn create(
        &self,
        transfer_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<Arc<dyn ChunkSink>>;
}

/// Source backed by a file on disk
#[derive(Debug)]
pub struct FileChunkSource {
    path: PathBuf,
    len: u64,
    file: tokio::sync::Mutex<File>,
}

impl FileChunkSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            len,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name sent to the receiver
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    }
}

#[async_trait]
impl ChunkSource for FileChunkSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_chunk(&self, offset: u64, size: u64) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Source over bytes already in memory
#[derive(Debug, Clone)]
pub struct MemoryChunkSource {
    data: Bytes,
}

impl MemoryChunkSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ChunkSource for MemoryChunkSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_chunk(&self, offset: u64, size: u64) -> Result<Bytes> {
        let start = offset as usize;
        let end = start.saturating_add(size as usize);
        if end > self.data.len() {
            return Err(Error::FileTransferFailed(format!(
                "read {}..{} past end of {} bytes",
                start,
                end,
                self.data.len()
            )));
        }
        Ok(self.data.slice(start..end))
    }
}

/// Sink writing into a file on disk
#[derive(Debug)]
pub struct FileChunkSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl FileChunkSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSink for FileChunkSink {
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn finish(&self) -> Result<u64> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(file.metadata().await?.len())
    }
}

/// Sink collecting into memory
#[derive(Debug, Default)]
pub struct MemoryChunkSink {
    buf: Mutex<Vec<u8>>,
}

impl MemoryChunkSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

#[async_trait]
impl ChunkSink for MemoryChunkSink {
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut buf = self.buf.lock();
        let start = offset as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn finish(&self) -> Result<u64> {
        Ok(self.buf.lock().len() as u64)
    }
}

/// Writes inbound transfers into one directory
#[derive(Debug, Clone)]
pub struct DirectorySinkFactory {
    dir: PathBuf,
}

impl DirectorySinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Destination for `file_name`, stripped of any directory components
    pub fn destination(&self, transfer_id: &str, file_name: &str) -> PathBuf {
        let name = Path::new(file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| transfer_id.to_string());
        self.dir.join(name)
    }
}

#[async_trait]
impl ChunkSinkFactory for DirectorySinkFactory {
    async fn create(
        &self,
        transfer_id: &str,
        file_name: &str,
        _file_size: u64,
    ) -> Result<Arc<dyn ChunkSink>> {
        let sink = FileChunkSink::create(self.destination(transfer_id, file_name)).await?;
        Ok(Arc::new(sink))
    }
}

/// Keeps every inbound transfer in memory, addressable by transfer id
#[derive(Debug, Default)]
pub struct MemorySinkFactory {
    sinks: Mutex<HashMap<String, Arc<MemoryChunkSink>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self, transfer_id: &str) -> Option<Arc<MemoryChunkSink>> {
        self.sinks.lock().get(transfer_id).cloned()
    }
}

#[async_trait]
impl ChunkSinkFactory for MemorySinkFactory {
    async fn create(
        &self,
        transfer_id: &str,
        _file_name: &str,
        _file_size: u64,
    ) -> Result<Arc<dyn ChunkSink>> {
        let sink = Arc::new(MemoryChunkSink::new());
        self.sinks
            .lock()
            .insert(transfer_id.to_string(), Arc::clone(&sink));
        Ok(sink)
    }
}
