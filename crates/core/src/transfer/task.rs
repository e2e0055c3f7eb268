//! Transfer task aggregate

use super::chunk::{partition, FileChunk};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transfer identifier
pub type TransferId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Waiting for a transfer slot
    Pending,
    Active,
    Paused,
    Completed,
    /// Retries exhausted; transferred chunks are kept for a manual retry
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled)
    }
}

/// One file transfer and the state of each of its chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub task_id: TransferId,
    pub direction: TransferDirection,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<FileChunk>,
    /// Always the sum of the sizes of transferred chunks
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TransferTask {
    pub fn new(
        task_id: impl Into<TransferId>,
        direction: TransferDirection,
        file_name: impl Into<String>,
        total_size: u64,
        chunk_size: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            direction,
            file_name: file_name.into(),
            total_size,
            chunk_size,
            chunks: partition(total_size, chunk_size),
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            created_at,
            error: None,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk(&self, index: u32) -> Result<&FileChunk> {
        self.chunks.get(index as usize).ok_or_else(|| {
            Error::FileTransferFailed(format!(
                "chunk {} out of range for {} ({} chunks)",
                index,
                self.task_id,
                self.chunks.len()
            ))
        })
    }

    /// Mark chunk `index` transferred; returns false if it already was
    pub fn mark_transferred(&mut self, index: u32) -> Result<bool> {
        self.chunk(index)?;
        let chunk = &mut self.chunks[index as usize];
        if chunk.transferred {
            return Ok(false);
        }
        chunk.transferred = true;
        self.transferred_bytes += chunk.size;
        Ok(true)
    }

    /// Count one failed attempt on chunk `index`; returns the new count
    pub fn record_retry(&mut self, index: u32) -> Result<u32> {
        self.chunk(index)?;
        let chunk = &mut self.chunks[index as usize];
        chunk.retry_count += 1;
        Ok(chunk.retry_count)
    }

    /// Byte offset right after the longest contiguous prefix of transferred
    /// chunks
    pub fn resume_offset(&self) -> u64 {
        self.chunks
            .iter()
            .take_while(|c| c.transferred)
            .last()
            .map_or(0, FileChunk::end)
    }

    /// Chunks still to send, in index order, starting at the resume offset
    pub fn pending_chunks(&self) -> Vec<FileChunk> {
        let from = self.resume_offset();
        self.chunks
            .iter()
            .filter(|c| !c.transferred && c.offset >= from)
            .copied()
            .collect()
    }

    /// Fraction transferred, in `[0, 1]`
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.is_all_transferred() { 1.0 } else { 0.0 };
        }
        (self.transferred_bytes as f64 / self.total_size as f64).clamp(0.0, 1.0)
    }

    pub fn is_all_transferred(&self) -> bool {
        self.chunks.iter().all(|c| c.transferred)
    }

    /// Check that the task really is complete
    ///
    /// Every chunk index must be transferred and `assembled_len` (the
    /// length of the reassembled data) must equal the declared size.
    pub fn verify_complete(&self, assembled_len: u64) -> Result<()> {
        if let Some(missing) = self.chunks.iter().find(|c| !c.transferred) {
            return Err(Error::FileTransferFailed(format!(
                "{}: chunk {} not transferred",
                self.task_id, missing.index
            )));
        }
        if self.transferred_bytes != self.total_size || assembled_len != self.total_size {
            return Err(Error::FileTransferFailed(format!(
                "{}: assembled {} bytes, expected {}",
                self.task_id, assembled_len, self.total_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn task(total: u64) -> TransferTask {
        TransferTask::new("t1", TransferDirection::Send, "f.bin", total, MIB, Utc::now())
    }

    #[test]
    fn test_resume_offset_uses_contiguous_prefix() {
        let mut t = task(5 * MIB);
        t.mark_transferred(0).unwrap();
        t.mark_transferred(1).unwrap();
        t.mark_transferred(3).unwrap();

        assert_eq!(t.resume_offset(), 2 * MIB);
        assert_eq!(t.transferred_bytes, 3 * MIB);
        let pending: Vec<_> = t.pending_chunks().iter().map(|c| c.index).collect();
        assert_eq!(pending, vec![2, 4]);
    }

    #[test]
    fn test_mark_twice_counts_once() {
        let mut t = task(3 * MIB);
        assert!(t.mark_transferred(1).unwrap());
        assert!(!t.mark_transferred(1).unwrap());
        assert_eq!(t.transferred_bytes, MIB);
        assert!(t.mark_transferred(7).is_err());
    }

    #[test]
    fn test_progress_bounds() {
        let mut t = task(MIB + 10);
        assert_eq!(t.progress(), 0.0);
        t.mark_transferred(1).unwrap();
        assert!(t.progress() > 0.0 && t.progress() < 0.01);
        t.mark_transferred(0).unwrap();
        assert_eq!(t.progress(), 1.0);
    }

    #[test]
    fn test_verify_complete() {
        let mut t = task(2 * MIB);
        t.mark_transferred(1).unwrap();
        assert!(t.verify_complete(2 * MIB).is_err());
        t.mark_transferred(0).unwrap();
        assert!(t.verify_complete(2 * MIB - 1).is_err());
        assert!(t.verify_complete(2 * MIB).is_ok());
    }

    #[test]
    fn test_empty_file() {
        let mut t = task(0);
        assert_eq!(t.total_chunks(), 1);
        assert_eq!(t.progress(), 0.0);
        t.mark_transferred(0).unwrap();
        assert_eq!(t.progress(), 1.0);
        assert!(t.verify_complete(0).is_ok());
    }
}
