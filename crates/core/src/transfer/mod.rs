//! Chunked, resumable file transfer over an established connection

pub mod chunk;
pub mod engine;
pub mod io;
pub mod task;
pub mod wire;

pub use chunk::{
    checked_chunk_count, compute_checksum, partition, FileChunk, DEFAULT_CHUNK_SIZE, MAX_CHUNKS,
};
pub use engine::{ReceiveOutcome, TransferEngine, TransferEvent, TransferEventKind};
pub use io::{
    ChunkSink, ChunkSinkFactory, ChunkSource, ChunkTransport, DirectorySinkFactory,
    FileChunkSink, FileChunkSource, MemoryChunkSink, MemoryChunkSource, MemorySinkFactory,
};
pub use task::{TransferDirection, TransferId, TransferStatus, TransferTask};
pub use wire::FileChunkMessage;
