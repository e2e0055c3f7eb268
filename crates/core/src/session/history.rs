//! Session history storage
//!
//! Ended sessions are appended as [`SessionRecord`]s and pruned once older
//! than the retention window.

use super::session::SessionRecord;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Backend for ended-session records
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: SessionRecord) -> Result<()>;

    /// Every retained record, oldest first
    async fn list(&self) -> Result<Vec<SessionRecord>>;

    /// Drop records that ended before `cutoff`; returns how many went
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// In-process history
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, record: SessionRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.end_time >= cutoff);
        Ok(before - records.len())
    }
}

/// History kept as JSON lines in one file
#[derive(Debug)]
pub struct JsonFileHistory {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<SessionRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable history line {} in {}: {}",
                    line_no + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }
}

fn encode_line(record: &SessionRecord) -> Result<String> {
    let mut line = serde_json::to_string(record)
        .map_err(|e| Error::SerializationError(format!("session record: {}", e)))?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl HistoryStore for JsonFileHistory {
    async fn append(&self, record: SessionRecord) -> Result<()> {
        let line = encode_line(&record)?;
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>> {
        self.read_all().await
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let records = self.read_all().await?;
        let before = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| r.end_time >= cutoff).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut text = String::new();
        for record in &kept {
            text.push_str(&encode_line(record)?);
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Pruned {} history records from {}", removed, self.path.display());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session::{EndReason, SessionPermissions, SessionRole, SessionStats};
    use chrono::Duration;

    fn record(id: &str, end_time: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            controller_id: "a".into(),
            controlled_id: "b".into(),
            role: SessionRole::Controller,
            start_time: end_time - Duration::minutes(5),
            end_time,
            duration_secs: 300,
            end_reason: EndReason::UserEnded,
            stats: SessionStats::default(),
            permissions: SessionPermissions::default(),
            was_relay: false,
        }
    }

    #[tokio::test]
    async fn test_memory_prune() {
        let store = MemoryHistory::new();
        let now = Utc::now();
        store.append(record("old", now - Duration::days(31))).await.unwrap();
        store.append(record("new", now - Duration::days(1))).await.unwrap();

        assert_eq!(store.prune(now - Duration::days(30)).await.unwrap(), 1);
        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].session_id, "new");
    }

    #[tokio::test]
    async fn test_json_file_roundtrip_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistory::new(dir.path().join("history").join("sessions.jsonl"));
        let now = Utc::now();

        assert!(store.list().await.unwrap().is_empty());

        store.append(record("s1", now - Duration::days(40))).await.unwrap();
        store.append(record("s2", now)).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        assert_eq!(store.prune(now - Duration::days(30)).await.unwrap(), 1);
        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].session_id, "s2");

        // reopened store sees the same file
        let reopened = JsonFileHistory::new(store.path());
        assert_eq!(reopened.list().await.unwrap(), left);
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");
        let store = JsonFileHistory::new(&path);
        store.append(record("s1", Utc::now())).await.unwrap();
        tokio::fs::write(
            &path,
            format!("not json\n{}", tokio::fs::read_to_string(&path).await.unwrap()),
        )
        .await
        .unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
