//! Resumable chunked transfer engine
//!
//! Outbound tasks wait in a FIFO queue for one of `max_concurrent` slots;
//! each admitted task gets a worker that sends its untransferred chunks in
//! index order starting at the resume offset. Pausing or cancelling bumps the
//! task's generation and aborts its worker, so a stale worker never marks a
//! chunk. Inbound tasks are created by the first chunk that arrives and do
//! not take slots.

use super::chunk::{checked_chunk_count, MAX_CHUNKS};
use super::io::{ChunkSink, ChunkSinkFactory, ChunkSource, ChunkTransport};
use super::task::{TransferDirection, TransferId, TransferStatus, TransferTask};
use super::wire::FileChunkMessage;
use crate::clock::Clock;
use crate::config::TransferConfig;
use crate::events::{EngineEvent, EventBus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEventKind {
    Queued,
    Started { resume_offset: u64 },
    Progress { transferred_bytes: u64, total_size: u64 },
    ChunkRetry { chunk_index: u32, retry_count: u32 },
    Paused,
    Completed,
    Failed { error_code: Option<u16>, message: String },
    Cancelled,
}

/// Published on every transfer state change and chunk completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub task_id: TransferId,
    pub direction: TransferDirection,
    pub kind: TransferEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Result of handing an inbound chunk to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Chunk written and marked
    Accepted,
    /// Chunk was already transferred; nothing written
    Duplicate,
    /// Chunk completed and verified the whole transfer
    Completed,
}

struct TaskEntry {
    task: TransferTask,
    source: Option<Arc<dyn ChunkSource>>,
    sink: Option<Arc<dyn ChunkSink>>,
    generation: u64,
    holds_slot: bool,
    worker: Option<AbortHandle>,
}

#[derive(Default)]
struct EngineState {
    tasks: HashMap<TransferId, TaskEntry>,
    queue: VecDeque<TransferId>,
    active: usize,
}

struct Inner {
    config: TransferConfig,
    transport: Arc<dyn ChunkTransport>,
    sinks: Option<Arc<dyn ChunkSinkFactory>>,
    state: Mutex<EngineState>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

/// Transfer engine of one connection
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransferEngine")
            .field("tasks", &state.tasks.len())
            .field("queued", &state.queue.len())
            .field("active", &state.active)
            .finish()
    }
}

impl TransferEngine {
    /// Engine sending over `transport`; inbound transfers need `sinks`
    pub fn new(
        config: TransferConfig,
        transport: Arc<dyn ChunkTransport>,
        sinks: Option<Arc<dyn ChunkSinkFactory>>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                sinks,
                state: Mutex::new(EngineState::default()),
                events,
                clock,
            }),
        }
    }

    /// Queue `source` for sending as `file_name`
    pub fn send(&self, file_name: &str, source: Arc<dyn ChunkSource>) -> Result<TransferId> {
        if checked_chunk_count(source.len(), self.inner.config.chunk_size).is_none() {
            return Err(Error::FileTransferFailed(format!(
                "{} ({} bytes) needs more than {} chunks",
                file_name,
                source.len(),
                MAX_CHUNKS
            )));
        }
        let task_id = Uuid::new_v4().to_string();
        let task = TransferTask::new(
            task_id.clone(),
            TransferDirection::Send,
            file_name,
            source.len(),
            self.inner.config.chunk_size,
            self.inner.clock.now(),
        );
        info!(
            "Queued transfer {} ({}, {} bytes in {} chunks)",
            task_id,
            file_name,
            task.total_size,
            task.total_chunks()
        );

        {
            let mut state = self.inner.state.lock();
            state.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task,
                    source: Some(source),
                    sink: None,
                    generation: 0,
                    holds_slot: false,
                    worker: None,
                },
            );
            state.queue.push_back(task_id.clone());
        }
        self.inner
            .publish(&task_id, TransferDirection::Send, TransferEventKind::Queued);
        self.inner.admit();
        Ok(task_id)
    }

    /// Stop scheduling chunks for a task, keeping its chunk state
    ///
    /// Pausing a paused task is a no-op.
    pub fn pause(&self, task_id: &str) -> Result<()> {
        let direction = {
            let mut state = self.inner.state.lock();
            let EngineState {
                tasks,
                queue,
                active,
            } = &mut *state;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TransferNotFound(task_id.to_string()))?;
            match entry.task.status {
                TransferStatus::Paused => return Ok(()),
                TransferStatus::Active | TransferStatus::Pending => {}
                other => {
                    return Err(Error::InvalidState(format!(
                        "cannot pause transfer {} in state {:?}",
                        task_id, other
                    )))
                }
            }
            entry.task.status = TransferStatus::Paused;
            stop_worker(entry, active);
            queue.retain(|id| id != task_id);
            entry.task.direction
        };

        info!("Paused transfer {}", task_id);
        self.inner.publish(task_id, direction, TransferEventKind::Paused);
        self.inner.admit();
        Ok(())
    }

    /// Continue a paused task from its resume offset
    ///
    /// Outbound tasks rejoin the back of the queue. Resuming a task that is
    /// not paused is a no-op.
    pub fn resume(&self, task_id: &str) -> Result<()> {
        self.requeue(task_id, TransferStatus::Paused)
    }

    /// Re-admit a failed task; transferred chunks are not sent again
    pub fn retry(&self, task_id: &str) -> Result<()> {
        self.requeue(task_id, TransferStatus::Failed)
    }

    fn requeue(&self, task_id: &str, from: TransferStatus) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let EngineState { tasks, queue, .. } = &mut *state;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TransferNotFound(task_id.to_string()))?;
            if entry.task.status != from {
                if from == TransferStatus::Paused
                    && matches!(
                        entry.task.status,
                        TransferStatus::Active | TransferStatus::Pending
                    )
                {
                    return Ok(());
                }
                return Err(Error::InvalidState(format!(
                    "transfer {} is {:?}, not {:?}",
                    task_id, entry.task.status, from
                )));
            }
            entry.task.error = None;
            match entry.task.direction {
                TransferDirection::Send => {
                    entry.task.status = TransferStatus::Pending;
                    queue.push_back(task_id.to_string());
                }
                TransferDirection::Receive => entry.task.status = TransferStatus::Active,
            }
        }

        debug!("Transfer {} re-admitted from {:?}", task_id, from);
        self.inner.admit();
        Ok(())
    }

    /// Cancel a task; destination cleanup is the caller's
    ///
    /// Cancelling a cancelled or completed task is a no-op.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let direction = {
            let mut state = self.inner.state.lock();
            let EngineState {
                tasks,
                queue,
                active,
            } = &mut *state;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TransferNotFound(task_id.to_string()))?;
            if entry.task.status.is_terminal() {
                return Ok(());
            }
            entry.task.status = TransferStatus::Cancelled;
            stop_worker(entry, active);
            entry.source = None;
            entry.sink = None;
            queue.retain(|id| id != task_id);
            entry.task.direction
        };

        info!("Cancelled transfer {}", task_id);
        self.inner
            .publish(task_id, direction, TransferEventKind::Cancelled);
        self.inner.admit();
        Ok(())
    }

    /// Handle one inbound chunk
    ///
    /// The first chunk of an unknown transfer creates a receive task through
    /// the sink factory. A checksum mismatch counts a retry on the chunk and
    /// is returned so the sender can resend; past the retry bound the task
    /// fails.
    pub async fn receive_chunk(&self, chunk: FileChunkMessage) -> Result<ReceiveOutcome> {
        let sink = self.receive_sink(&chunk).await?;
        let task_id = chunk.transfer_id.clone();

        let expected_size = {
            let mut state = self.inner.state.lock();
            let entry = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::TransferNotFound(task_id.clone()))?;
            match entry.task.status {
                TransferStatus::Active => {}
                TransferStatus::Completed => return Ok(ReceiveOutcome::Duplicate),
                other => {
                    return Err(Error::InvalidState(format!(
                        "transfer {} is {:?}",
                        task_id, other
                    )))
                }
            }
            if chunk.total_chunks != entry.task.total_chunks()
                || chunk.file_size != entry.task.total_size
                || chunk.chunk_size != entry.task.chunk_size
            {
                return Err(Error::FileTransferFailed(format!(
                    "chunk {} of {} does not match the transfer geometry",
                    chunk.chunk_index, task_id
                )));
            }
            let expected = entry.task.chunk(chunk.chunk_index)?;
            if expected.transferred {
                return Ok(ReceiveOutcome::Duplicate);
            }
            expected.size
        };

        if chunk.chunk_data.len() as u64 != expected_size {
            let e = Error::FileTransferFailed(format!(
                "chunk {} of {} carries {} bytes, expected {}",
                chunk.chunk_index,
                task_id,
                chunk.chunk_data.len(),
                expected_size
            ));
            self.inner.chunk_failed(&task_id, chunk.chunk_index, &e);
            return Err(e);
        }
        if let Err(e) = chunk.verify() {
            self.inner.chunk_failed(&task_id, chunk.chunk_index, &e);
            return Err(e);
        }
        if let Err(e) = sink.write_chunk(chunk.offset(), chunk.chunk_data.clone()).await {
            self.inner.chunk_failed(&task_id, chunk.chunk_index, &e);
            return Err(e);
        }

        let complete = {
            let mut state = self.inner.state.lock();
            let entry = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::TransferNotFound(task_id.clone()))?;
            if entry.task.status != TransferStatus::Active {
                return Err(Error::InvalidState(format!(
                    "transfer {} is {:?}",
                    task_id, entry.task.status
                )));
            }
            if !entry.task.mark_transferred(chunk.chunk_index)? {
                return Ok(ReceiveOutcome::Duplicate);
            }
            self.inner.publish_progress(&entry.task);
            entry.task.is_all_transferred()
        };
        if !complete {
            return Ok(ReceiveOutcome::Accepted);
        }

        let assembled = sink.finish().await?;
        let verdict = {
            let mut state = self.inner.state.lock();
            let entry = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::TransferNotFound(task_id.clone()))?;
            if entry.task.status == TransferStatus::Completed {
                return Ok(ReceiveOutcome::Duplicate);
            }
            let verdict = entry.task.verify_complete(assembled);
            match &verdict {
                Ok(()) => {
                    entry.task.status = TransferStatus::Completed;
                    entry.sink = None;
                }
                Err(e) => {
                    entry.task.status = TransferStatus::Failed;
                    entry.task.error = Some(e.to_string());
                }
            }
            verdict
        };

        match verdict {
            Ok(()) => {
                info!("Received transfer {} ({} bytes)", task_id, assembled);
                self.inner
                    .publish(&task_id, TransferDirection::Receive, TransferEventKind::Completed);
                Ok(ReceiveOutcome::Completed)
            }
            Err(e) => {
                error!("Transfer {} failed verification: {}", task_id, e);
                self.inner
                    .publish(&task_id, TransferDirection::Receive, failed_kind(&e));
                Err(e)
            }
        }
    }

    async fn receive_sink(&self, chunk: &FileChunkMessage) -> Result<Arc<dyn ChunkSink>> {
        if let Some(entry) = self.inner.state.lock().tasks.get(&chunk.transfer_id) {
            return match (&entry.task.direction, &entry.sink) {
                (TransferDirection::Receive, Some(sink)) => Ok(Arc::clone(sink)),
                (TransferDirection::Receive, None) => Err(Error::InvalidState(format!(
                    "transfer {} is {:?}",
                    chunk.transfer_id, entry.task.status
                ))),
                (TransferDirection::Send, _) => Err(Error::FileTransferFailed(format!(
                    "transfer {} is outbound",
                    chunk.transfer_id
                ))),
            };
        }

        let factory = self.inner.sinks.as_ref().ok_or_else(|| {
            Error::FileTransferFailed("inbound transfers are not accepted".to_string())
        })?;
        if checked_chunk_count(chunk.file_size, chunk.chunk_size) != Some(chunk.total_chunks) {
            warn!(
                "Refusing transfer {}: {} bytes in {} chunks of {}",
                chunk.transfer_id, chunk.file_size, chunk.total_chunks, chunk.chunk_size
            );
            return Err(Error::FileTransferFailed(format!(
                "transfer {} declares an invalid geometry",
                chunk.transfer_id
            )));
        }
        let sink = factory
            .create(&chunk.transfer_id, &chunk.file_name, chunk.file_size)
            .await?;

        let mut state = self.inner.state.lock();
        if let Some(entry) = state.tasks.get(&chunk.transfer_id) {
            // raced with another first chunk
            return entry
                .sink
                .clone()
                .ok_or_else(|| Error::InvalidState(format!("transfer {} closed", chunk.transfer_id)));
        }
        let mut task = TransferTask::new(
            chunk.transfer_id.clone(),
            TransferDirection::Receive,
            chunk.file_name.clone(),
            chunk.file_size,
            chunk.chunk_size,
            self.inner.clock.now(),
        );
        task.status = TransferStatus::Active;
        info!(
            "Receiving transfer {} ({}, {} bytes)",
            chunk.transfer_id, chunk.file_name, chunk.file_size
        );
        state.tasks.insert(
            chunk.transfer_id.clone(),
            TaskEntry {
                task,
                source: None,
                sink: Some(Arc::clone(&sink)),
                generation: 0,
                holds_slot: false,
                worker: None,
            },
        );
        drop(state);
        self.inner.publish(
            &chunk.transfer_id,
            TransferDirection::Receive,
            TransferEventKind::Started { resume_offset: 0 },
        );
        Ok(sink)
    }

    /// Snapshot of one task
    pub fn get(&self, task_id: &str) -> Result<TransferTask> {
        self.inner
            .state
            .lock()
            .tasks
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| Error::TransferNotFound(task_id.to_string()))
    }

    /// Snapshots of every task, oldest first
    pub fn tasks(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<_> = self
            .inner
            .state
            .lock()
            .tasks
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn progress(&self, task_id: &str) -> Result<f64> {
        Ok(self.get(task_id)?.progress())
    }

    /// Outbound tasks currently holding a slot
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Wait until the task stops making progress on its own
    ///
    /// Returns once it is Completed, Failed, Cancelled or Paused.
    pub async fn wait_settled(&self, task_id: &str) -> Result<TransferStatus> {
        let mut rx = self.inner.events.subscribe();
        loop {
            let status = self.get(task_id)?.status;
            if !matches!(status, TransferStatus::Pending | TransferStatus::Active) {
                return Ok(status);
            }
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(Error::InvalidState("event bus closed".to_string()))
                }
            }
        }
    }
}

/// Bump the generation, abort the worker and free the slot
fn stop_worker(entry: &mut TaskEntry, active: &mut usize) {
    entry.generation += 1;
    if let Some(worker) = entry.worker.take() {
        worker.abort();
    }
    if entry.holds_slot {
        entry.holds_slot = false;
        *active -= 1;
    }
}

fn failed_kind(e: &Error) -> TransferEventKind {
    TransferEventKind::Failed {
        error_code: e.code().map(|c| c.as_u16()),
        message: e.to_string(),
    }
}

impl Inner {
    /// Promote queued tasks into free slots, oldest first
    fn admit(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.state.lock();
            while state.active < self.config.max_concurrent.max(1) {
                let Some(task_id) = state.queue.pop_front() else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if entry.task.status != TransferStatus::Pending {
                    continue;
                }
                entry.task.status = TransferStatus::Active;
                entry.holds_slot = true;
                entry.generation += 1;
                let generation = entry.generation;
                let resume_offset = entry.task.resume_offset();
                state.active += 1;
                started.push((task_id, generation, resume_offset));
            }
        }

        for (task_id, generation, resume_offset) in started {
            info!(
                "Starting transfer {} at offset {}",
                task_id, resume_offset
            );
            self.publish(
                &task_id,
                TransferDirection::Send,
                TransferEventKind::Started { resume_offset },
            );
            let handle = tokio::spawn(Arc::clone(self).run_worker(task_id.clone(), generation));

            let mut state = self.state.lock();
            match state.tasks.get_mut(&task_id) {
                Some(entry) if entry.generation == generation => {
                    entry.worker = Some(handle.abort_handle());
                }
                _ => handle.abort(),
            }
        }
    }

    async fn run_worker(self: Arc<Self>, task_id: TransferId, generation: u64) {
        let (template, source) = {
            let state = self.state.lock();
            match state.tasks.get(&task_id) {
                Some(e) if e.generation == generation => match &e.source {
                    Some(source) => (e.task.clone(), Arc::clone(source)),
                    None => return,
                },
                _ => return,
            }
        };

        loop {
            let next = {
                let state = self.state.lock();
                match state.tasks.get(&task_id) {
                    Some(e) if e.generation == generation && e.task.status == TransferStatus::Active => {
                        e.task.pending_chunks().first().copied()
                    }
                    _ => return,
                }
            };
            let Some(chunk) = next else {
                self.finish_send(&task_id, generation);
                return;
            };

            let mut attempt = 0;
            loop {
                let sent = async {
                    let data = source.read_chunk(chunk.offset, chunk.size).await?;
                    let message = FileChunkMessage::new(&template, chunk.index, data, self.clock.now());
                    self.transport.send_chunk(message).await
                }
                .await;

                match sent {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            "Transfer {} chunk {} attempt {} failed: {}",
                            task_id,
                            chunk.index,
                            attempt + 1,
                            e
                        );
                        if !self.still_current(&task_id, generation) {
                            return;
                        }
                        self.chunk_failed(&task_id, chunk.index, &e);
                        if !self.config.chunk_retry.should_retry(attempt) {
                            let failure = match e {
                                Error::ChecksumMismatch(m) => Error::ChecksumMismatch(m),
                                other => Error::FileTransferFailed(format!(
                                    "chunk {} failed after {} attempts: {}",
                                    chunk.index,
                                    attempt + 1,
                                    other
                                )),
                            };
                            self.fail_send(&task_id, generation, failure);
                            return;
                        }
                        tokio::time::sleep(self.config.chunk_retry.calculate_backoff(attempt)).await;
                        attempt += 1;
                    }
                }
            }

            let mut state = self.state.lock();
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if entry.generation != generation {
                debug!("Discarding stale result for {} chunk {}", task_id, chunk.index);
                return;
            }
            match entry.task.mark_transferred(chunk.index) {
                Ok(_) => self.publish_progress(&entry.task),
                Err(e) => {
                    drop(state);
                    self.fail_send(&task_id, generation, e);
                    return;
                }
            }
        }
    }

    fn still_current(&self, task_id: &str, generation: u64) -> bool {
        self.state
            .lock()
            .tasks
            .get(task_id)
            .is_some_and(|e| e.generation == generation)
    }

    /// Count a failed attempt on a chunk; fails a receive task past the bound
    fn chunk_failed(&self, task_id: &str, index: u32, cause: &Error) {
        let mut state = self.state.lock();
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return;
        };
        let Ok(retry_count) = entry.task.record_retry(index) else {
            return;
        };
        self.publish(
            task_id,
            entry.task.direction,
            TransferEventKind::ChunkRetry {
                chunk_index: index,
                retry_count,
            },
        );

        if entry.task.direction == TransferDirection::Receive
            && entry.task.status == TransferStatus::Active
            && retry_count > self.config.chunk_retry.max_retries
        {
            let failure = match cause {
                Error::ChecksumMismatch(m) => Error::ChecksumMismatch(m.clone()),
                other => Error::FileTransferFailed(format!(
                    "chunk {} failed {} times: {}",
                    index, retry_count, other
                )),
            };
            error!("Transfer {} failed: {}", task_id, failure);
            entry.task.status = TransferStatus::Failed;
            entry.task.error = Some(failure.to_string());
            self.publish(task_id, TransferDirection::Receive, failed_kind(&failure));
        }
    }

    fn finish_send(self: &Arc<Self>, task_id: &str, generation: u64) {
        let verdict = {
            let mut state = self.state.lock();
            let EngineState { tasks, active, .. } = &mut *state;
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            let verdict = entry.task.verify_complete(entry.task.transferred_bytes);
            match &verdict {
                Ok(()) => {
                    entry.task.status = TransferStatus::Completed;
                    entry.source = None;
                }
                Err(e) => {
                    entry.task.status = TransferStatus::Failed;
                    entry.task.error = Some(e.to_string());
                }
            }
            entry.worker = None;
            if entry.holds_slot {
                entry.holds_slot = false;
                *active -= 1;
            }
            verdict
        };

        match verdict {
            Ok(()) => {
                info!("Transfer {} completed", task_id);
                self.publish(task_id, TransferDirection::Send, TransferEventKind::Completed);
            }
            Err(e) => {
                error!("Transfer {} failed verification: {}", task_id, e);
                self.publish(task_id, TransferDirection::Send, failed_kind(&e));
            }
        }
        self.admit();
    }

    fn fail_send(self: &Arc<Self>, task_id: &str, generation: u64, failure: Error) {
        {
            let mut state = self.state.lock();
            let EngineState { tasks, active, .. } = &mut *state;
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.task.status = TransferStatus::Failed;
            entry.task.error = Some(failure.to_string());
            entry.worker = None;
            if entry.holds_slot {
                entry.holds_slot = false;
                *active -= 1;
            }
        }

        error!("Transfer {} failed: {}", task_id, failure);
        self.publish(task_id, TransferDirection::Send, failed_kind(&failure));
        self.admit();
    }

    fn publish_progress(&self, task: &TransferTask) {
        self.publish(
            &task.task_id,
            task.direction,
            TransferEventKind::Progress {
                transferred_bytes: task.transferred_bytes,
                total_size: task.total_size,
            },
        );
    }

    fn publish(&self, task_id: &str, direction: TransferDirection, kind: TransferEventKind) {
        self.events.publish(EngineEvent::Transfer(TransferEvent {
            task_id: task_id.to_string(),
            direction,
            kind,
            timestamp: self.clock.now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::lifecycle::BackoffPolicy;
    use crate::transfer::io::{MemoryChunkSource, MemorySinkFactory};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Semaphore;

    /// Transport that lets one chunk through per permit
    struct GatedTransport {
        gate: Semaphore,
        sent: Mutex<Vec<(String, u32)>>,
    }

    impl GatedTransport {
        fn new(permits: usize) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(permits),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_indices(&self, task_id: &str) -> Vec<u32> {
            self.sent
                .lock()
                .iter()
                .filter(|(id, _)| id == task_id)
                .map(|(_, i)| *i)
                .collect()
        }
    }

    #[async_trait]
    impl ChunkTransport for GatedTransport {
        async fn send_chunk(&self, chunk: FileChunkMessage) -> Result<()> {
            self.gate
                .acquire()
                .await
                .map_err(|e| Error::DataChannelClosed(e.to_string()))?
                .forget();
            self.sent.lock().push((chunk.transfer_id, chunk.chunk_index));
            Ok(())
        }
    }

    /// Fails every send while `failures_left` > 0
    struct FlakyTransport {
        failures_left: AtomicU32,
        sent: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ChunkTransport for FlakyTransport {
        async fn send_chunk(&self, chunk: FileChunkMessage) -> Result<()> {
            if chunk.chunk_index == 1
                && self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(Error::DataChannelClosed("link down".into()));
            }
            self.sent.lock().push(chunk.chunk_index);
            Ok(())
        }
    }

    fn config(chunk_size: u64, max_concurrent: usize) -> TransferConfig {
        TransferConfig {
            chunk_size,
            max_concurrent,
            chunk_retry: BackoffPolicy {
                max_retries: 2,
                initial_ms: 10,
                max_ms: 100,
                multiplier: 2.0,
                jitter_enabled: false,
            },
        }
    }

    fn engine(config: TransferConfig, transport: Arc<dyn ChunkTransport>) -> TransferEngine {
        TransferEngine::new(
            config,
            transport,
            Some(Arc::new(MemorySinkFactory::new())),
            EventBus::default(),
            Arc::new(SystemClock),
        )
    }

    fn source(len: usize) -> Arc<dyn ChunkSource> {
        Arc::new(MemoryChunkSource::new(
            (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
        ))
    }

    async fn wait_for_bytes(engine: &TransferEngine, task_id: &str, bytes: u64) {
        let mut rx = engine.inner.events.subscribe();
        while engine.get(task_id).unwrap().transferred_bytes < bytes {
            let _ = rx.recv().await;
        }
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let transport = GatedTransport::new(0);
        let engine = engine(config(4, 1), transport.clone());

        let first = engine.send("a", source(8)).unwrap();
        let second = engine.send("b", source(8)).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(engine.get(&first).unwrap().status, TransferStatus::Active);
        assert_eq!(engine.get(&second).unwrap().status, TransferStatus::Pending);
        assert_eq!(engine.active_count(), 1);

        transport.gate.add_permits(4);
        assert_eq!(engine.wait_settled(&first).await.unwrap(), TransferStatus::Completed);
        assert_eq!(engine.wait_settled(&second).await.unwrap(), TransferStatus::Completed);
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_resume_never_resends() {
        let transport = GatedTransport::new(2);
        let engine = engine(config(4, 3), transport.clone());
        let id = engine.send("f", source(20)).unwrap();

        wait_for_bytes(&engine, &id, 8).await;
        engine.pause(&id).unwrap();
        engine.pause(&id).unwrap();
        assert_eq!(engine.get(&id).unwrap().resume_offset(), 8);
        assert_eq!(engine.active_count(), 0);

        transport.gate.add_permits(10);
        engine.resume(&id).unwrap();
        assert_eq!(engine.wait_settled(&id).await.unwrap(), TransferStatus::Completed);
        assert_eq!(transport.sent_indices(&id), vec![0, 1, 2, 3, 4]);
        assert_eq!(engine.progress(&id).unwrap(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_preserves_chunks() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicU32::new(3),
            sent: Mutex::new(Vec::new()),
        });
        let engine = engine(config(4, 3), transport.clone());
        let id = engine.send("f", source(12)).unwrap();

        assert_eq!(engine.wait_settled(&id).await.unwrap(), TransferStatus::Failed);
        let task = engine.get(&id).unwrap();
        assert!(task.chunks[0].transferred);
        assert_eq!(task.chunks[1].retry_count, 3);
        assert!(task.error.unwrap().contains("File transfer failed"));

        // link recovered
        engine.retry(&id).unwrap();
        assert_eq!(engine.wait_settled(&id).await.unwrap(), TransferStatus::Completed);
        assert_eq!(*transport.sent.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let transport = GatedTransport::new(0);
        let engine = engine(config(4, 1), transport.clone());
        let id = engine.send("f", source(8)).unwrap();
        let queued = engine.send("g", source(8)).unwrap();

        engine.cancel(&id).unwrap();
        engine.cancel(&id).unwrap();
        assert_eq!(engine.get(&id).unwrap().status, TransferStatus::Cancelled);
        // freed slot promotes the queued task
        assert_eq!(engine.get(&queued).unwrap().status, TransferStatus::Active);
        assert!(matches!(engine.cancel("nope"), Err(Error::TransferNotFound(_))));
        assert!(engine.resume(&id).is_err());
    }

    fn chunk_for(task: &TransferTask, data: &[u8], index: u32) -> FileChunkMessage {
        let c = task.chunks[index as usize];
        let bytes = Bytes::copy_from_slice(&data[c.offset as usize..c.end() as usize]);
        FileChunkMessage::new(task, index, bytes, Utc::now())
    }

    #[tokio::test]
    async fn test_receive_out_of_order_with_duplicate() {
        let sinks = Arc::new(MemorySinkFactory::new());
        let engine = TransferEngine::new(
            config(4, 3),
            GatedTransport::new(0),
            Some(sinks.clone()),
            EventBus::default(),
            Arc::new(SystemClock),
        );
        let data: Vec<u8> = (0..10u8).collect();
        let outbound = TransferTask::new("t9", TransferDirection::Send, "f", 10, 4, Utc::now());

        let c2 = chunk_for(&outbound, &data, 2);
        assert_eq!(engine.receive_chunk(c2.clone()).await.unwrap(), ReceiveOutcome::Accepted);
        assert_eq!(engine.receive_chunk(c2).await.unwrap(), ReceiveOutcome::Duplicate);
        assert_eq!(engine.get("t9").unwrap().resume_offset(), 0);

        assert_eq!(
            engine.receive_chunk(chunk_for(&outbound, &data, 0)).await.unwrap(),
            ReceiveOutcome::Accepted
        );
        assert_eq!(
            engine.receive_chunk(chunk_for(&outbound, &data, 1)).await.unwrap(),
            ReceiveOutcome::Completed
        );

        let task = engine.get("t9").unwrap();
        assert_eq!(task.status, TransferStatus::Completed);
        assert_eq!(task.transferred_bytes, 10);
        assert_eq!(sinks.sink("t9").unwrap().contents(), data);
    }

    #[tokio::test]
    async fn test_receive_checksum_mismatch_bounded() {
        let engine = engine(config(4, 3), GatedTransport::new(0));
        let data: Vec<u8> = (0..8u8).collect();
        let outbound = TransferTask::new("t7", TransferDirection::Send, "f", 8, 4, Utc::now());

        let mut bad = chunk_for(&outbound, &data, 0);
        bad.chunk_data = Bytes::from_static(b"zzzz");

        for _ in 0..3 {
            assert!(matches!(
                engine.receive_chunk(bad.clone()).await,
                Err(Error::ChecksumMismatch(_))
            ));
        }
        let task = engine.get("t7").unwrap();
        assert_eq!(task.status, TransferStatus::Failed);
        assert_eq!(task.chunks[0].retry_count, 3);

        // manual retry resumes the receive task
        engine.retry("t7").unwrap();
        assert_eq!(
            engine.receive_chunk(chunk_for(&outbound, &data, 0)).await.unwrap(),
            ReceiveOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_receive_rejects_wrong_length_chunks() {
        let sinks = Arc::new(MemorySinkFactory::new());
        let engine = TransferEngine::new(
            config(4, 3),
            GatedTransport::new(0),
            Some(sinks.clone()),
            EventBus::default(),
            Arc::new(SystemClock),
        );
        let data: Vec<u8> = (1..=10u8).collect();
        let outbound = TransferTask::new("t5", TransferDirection::Send, "f", 10, 4, Utc::now());

        assert_eq!(
            engine.receive_chunk(chunk_for(&outbound, &data, 0)).await.unwrap(),
            ReceiveOutcome::Accepted
        );

        // valid checksum over a truncated payload
        let short = FileChunkMessage::new(&outbound, 1, Bytes::from_static(&[5, 6]), Utc::now());
        assert!(matches!(
            engine.receive_chunk(short).await,
            Err(Error::FileTransferFailed(_))
        ));
        let long = FileChunkMessage::new(
            &outbound,
            1,
            Bytes::from_static(&[5, 6, 7, 8, 0, 0]),
            Utc::now(),
        );
        assert!(matches!(
            engine.receive_chunk(long).await,
            Err(Error::FileTransferFailed(_))
        ));

        let task = engine.get("t5").unwrap();
        assert!(!task.chunks[1].transferred);
        assert_eq!(task.chunks[1].retry_count, 2);
        assert_eq!(task.transferred_bytes, 4);

        assert_eq!(
            engine.receive_chunk(chunk_for(&outbound, &data, 2)).await.unwrap(),
            ReceiveOutcome::Accepted
        );
        assert_eq!(
            engine.receive_chunk(chunk_for(&outbound, &data, 1)).await.unwrap(),
            ReceiveOutcome::Completed
        );
        assert_eq!(engine.get("t5").unwrap().transferred_bytes, 10);
        assert_eq!(sinks.sink("t5").unwrap().contents(), data);
    }

    #[tokio::test]
    async fn test_receive_refuses_untrusted_geometry() {
        let sinks = Arc::new(MemorySinkFactory::new());
        let engine = TransferEngine::new(
            config(4, 3),
            GatedTransport::new(0),
            Some(sinks.clone()),
            EventBus::default(),
            Arc::new(SystemClock),
        );
        let small = TransferTask::new("g0", TransferDirection::Send, "f", 4, 4, Utc::now());
        let template = FileChunkMessage::new(&small, 0, Bytes::from_static(b"abcd"), Utc::now());

        let huge = FileChunkMessage {
            file_size: u32::MAX as u64,
            chunk_size: 1,
            total_chunks: u32::MAX,
            ..template.clone()
        };
        let wrapped = FileChunkMessage {
            file_size: 1 << 32,
            chunk_size: 1,
            total_chunks: 0,
            ..template.clone()
        };
        let mismatched = FileChunkMessage {
            total_chunks: 7,
            ..template
        };

        for chunk in [huge, wrapped, mismatched] {
            assert!(matches!(
                engine.receive_chunk(chunk).await,
                Err(Error::FileTransferFailed(_))
            ));
        }
        assert!(engine.tasks().is_empty());
        assert!(sinks.sink("g0").is_none());
    }
}
