//! Sender and receiver engines joined by an in-memory data channel

use async_trait::async_trait;
use parking_lot::Mutex;
use remotedesk_core::transfer::{
    ChunkTransport, FileChunkMessage, FileChunkSource, MemoryChunkSource, MemorySinkFactory,
    ReceiveOutcome, TransferEngine, DEFAULT_CHUNK_SIZE,
};
use remotedesk_core::{EventBus, Result, SystemClock, TransferConfig, TransferStatus};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Data channel delivering straight into a receiving engine, one chunk per permit
struct LoopbackChannel {
    gate: Semaphore,
    receiver: TransferEngine,
    delivered: Mutex<Vec<u32>>,
}

#[async_trait]
impl ChunkTransport for LoopbackChannel {
    async fn send_chunk(&self, chunk: FileChunkMessage) -> Result<()> {
        self.gate
            .acquire()
            .await
            .map_err(|e| remotedesk_core::Error::DataChannelClosed(e.to_string()))?
            .forget();
        let index = chunk.chunk_index;
        // round-trip the wire encoding
        let chunk = FileChunkMessage::from_json(&chunk.to_json()?)?;
        match self.receiver.receive_chunk(chunk).await? {
            ReceiveOutcome::Duplicate => {}
            ReceiveOutcome::Accepted | ReceiveOutcome::Completed => self.delivered.lock().push(index),
        }
        Ok(())
    }
}

fn engines(permits: usize) -> (TransferEngine, Arc<LoopbackChannel>, Arc<MemorySinkFactory>, EventBus) {
    let config = TransferConfig::default();
    let sinks = Arc::new(MemorySinkFactory::new());
    let receiver = TransferEngine::new(
        config.clone(),
        Arc::new(NoReply),
        Some(sinks.clone()),
        EventBus::default(),
        Arc::new(SystemClock),
    );
    let channel = Arc::new(LoopbackChannel {
        gate: Semaphore::new(permits),
        receiver,
        delivered: Mutex::new(Vec::new()),
    });
    let events = EventBus::default();
    let sender = TransferEngine::new(
        config,
        channel.clone(),
        None,
        events.clone(),
        Arc::new(SystemClock),
    );
    (sender, channel, sinks, events)
}

struct NoReply;

#[async_trait]
impl ChunkTransport for NoReply {
    async fn send_chunk(&self, _chunk: FileChunkMessage) -> Result<()> {
        Ok(())
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

#[tokio::test]
async fn test_pause_after_two_chunks_resumes_at_two_mib() {
    let data = payload(5 * DEFAULT_CHUNK_SIZE as usize);
    let (sender, channel, sinks, events) = engines(2);
    let mut rx = events.subscribe();

    let id = sender
        .send("video.mp4", Arc::new(MemoryChunkSource::new(data.clone())))
        .unwrap();
    assert_eq!(sender.get(&id).unwrap().total_chunks(), 5);

    while sender.get(&id).unwrap().transferred_bytes < 2 * DEFAULT_CHUNK_SIZE {
        let _ = rx.recv().await;
    }
    sender.pause(&id).unwrap();

    let paused = sender.get(&id).unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);
    assert_eq!(paused.resume_offset(), 2 * 1024 * 1024);
    assert_eq!(paused.pending_chunks().len(), 3);

    channel.gate.add_permits(16);
    sender.resume(&id).unwrap();
    assert_eq!(sender.wait_settled(&id).await.unwrap(), TransferStatus::Completed);

    assert_eq!(*channel.delivered.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(channel.receiver.get(&id).unwrap().status, TransferStatus::Completed);
    assert_eq!(sinks.sink(&id).unwrap().contents(), data);
}

#[tokio::test]
async fn test_file_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.pdf");
    let data = payload(DEFAULT_CHUNK_SIZE as usize + 123);
    tokio::fs::write(&path, &data).await.unwrap();

    let (sender, channel, sinks, _events) = engines(64);
    let source = FileChunkSource::open(&path).await.unwrap();
    let name = source.file_name();
    let id = sender.send(&name, Arc::new(source)).unwrap();

    assert_eq!(sender.wait_settled(&id).await.unwrap(), TransferStatus::Completed);
    let received = channel.receiver.get(&id).unwrap();
    assert_eq!(received.file_name, "report.pdf");
    assert_eq!(received.total_chunks(), 2);
    assert_eq!(sinks.sink(&id).unwrap().contents(), data);
}

#[tokio::test]
async fn test_empty_file_completes() {
    let (sender, _channel, sinks, _events) = engines(4);
    let id = sender
        .send("empty.txt", Arc::new(MemoryChunkSource::new(Vec::<u8>::new())))
        .unwrap();

    assert_eq!(sender.wait_settled(&id).await.unwrap(), TransferStatus::Completed);
    assert_eq!(sender.progress(&id).unwrap(), 1.0);
    assert!(sinks.sink(&id).unwrap().contents().is_empty());
}
