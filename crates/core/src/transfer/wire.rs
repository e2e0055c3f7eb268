//! File chunk wire message

use super::chunk::{compute_checksum, verify_checksum};
use super::task::TransferTask;
use crate::clock::unix_millis;
use crate::{Error, Result};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Type tag of [`FileChunkMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChunkTag {
    #[serde(rename = "file_chunk")]
    FileChunk,
}

/// One chunk on the data channel
///
/// Carries the chunk index and total count so the receiver can track
/// completeness without a side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkMessage {
    #[serde(rename = "type")]
    pub tag: FileChunkTag,
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Nominal chunk size of the transfer; places chunk `i` at `i * chunkSize`
    pub chunk_size: u64,
    #[serde(serialize_with = "encode_data", deserialize_with = "decode_data")]
    pub chunk_data: Bytes,
    /// Hex SHA-256 of `chunk_data`
    pub checksum: String,
    pub timestamp_ms: u64,
}

impl FileChunkMessage {
    /// Message for chunk `index` of `task`
    pub fn new(task: &TransferTask, index: u32, data: Bytes, now: DateTime<Utc>) -> Self {
        Self {
            tag: FileChunkTag::FileChunk,
            transfer_id: task.task_id.clone(),
            file_name: task.file_name.clone(),
            file_size: task.total_size,
            chunk_index: index,
            total_chunks: task.total_chunks(),
            chunk_size: task.chunk_size,
            checksum: compute_checksum(&data),
            chunk_data: data,
            timestamp_ms: unix_millis(now),
        }
    }

    pub fn offset(&self) -> u64 {
        self.chunk_index as u64 * self.chunk_size
    }

    /// Check the payload against its checksum and declared geometry
    pub fn verify(&self) -> Result<()> {
        if self.chunk_index >= self.total_chunks {
            return Err(Error::FileTransferFailed(format!(
                "chunk {} of {} out of range",
                self.chunk_index, self.total_chunks
            )));
        }
        if !verify_checksum(&self.chunk_data, &self.checksum) {
            return Err(Error::ChecksumMismatch(format!(
                "{} chunk {}",
                self.transfer_id, self.chunk_index
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::SerializationError(format!("file chunk encode: {}", e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::SerializationError(format!("file chunk decode: {}", e)))
    }
}

fn encode_data<S: Serializer>(data: &Bytes, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

fn decode_data<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Bytes, D::Error> {
    let text = String::deserialize(d)?;
    base64::engine::general_purpose::STANDARD
        .decode(text.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::task::TransferDirection;

    fn message() -> FileChunkMessage {
        let task = TransferTask::new("t1", TransferDirection::Send, "notes.txt", 10, 4, Utc::now());
        FileChunkMessage::new(&task, 2, Bytes::from_static(b"ab"), Utc::now())
    }

    #[test]
    fn test_json_shape() {
        let json: serde_json::Value = serde_json::from_str(&message().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "file_chunk");
        assert_eq!(json["transferId"], "t1");
        assert_eq!(json["fileSize"], 10);
        assert_eq!(json["chunkIndex"], 2);
        assert_eq!(json["totalChunks"], 3);
        assert_eq!(json["chunkData"], "YWI=");
    }

    #[test]
    fn test_rejects_other_type() {
        let mut json: serde_json::Value = serde_json::from_str(&message().to_json().unwrap()).unwrap();
        json["type"] = "heartbeat".into();
        assert!(FileChunkMessage::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn test_verify() {
        let mut msg = message();
        assert!(msg.verify().is_ok());
        assert_eq!(msg.offset(), 8);

        msg.chunk_data = Bytes::from_static(b"xx");
        assert!(matches!(msg.verify(), Err(Error::ChecksumMismatch(_))));

        let mut msg = message();
        msg.chunk_index = 3;
        assert!(matches!(msg.verify(), Err(Error::FileTransferFailed(_))));
    }
}
