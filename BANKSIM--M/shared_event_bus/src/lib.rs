#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Notice bus used by the simulation core to announce lifecycle milestones
//! (scenario loaded, step dispatched, run completed) to outside observers.
//!
//! Notices are not simulation events: they are never queued or dispatched by
//! the event system, only broadcast after the fact.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};

/// Lifecycle notice encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeRecord {
    /// Unique identifier.
    pub id: String,
    /// Component producing the notice.
    pub source: String,
    /// Dotted notice kind (e.g., `simulation.run.completed`).
    pub kind: String,
    /// Simulation step the notice refers to, when it refers to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    /// ISO timestamp.
    pub timestamp: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Notice publisher interface.
#[async_trait]
pub trait NoticePublisher: Send + Sync {
    /// Publishes a notice.
    async fn publish(&self, notice: NoticeRecord) -> Result<()>;
}

/// Notice subscriber interface.
#[async_trait]
pub trait NoticeSubscriber: Send + Sync {
    /// Returns a receiver that yields every notice published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<NoticeRecord>>;
}

/// In-memory broadcast bus keeping a bounded backlog of recent notices.
#[derive(Debug, Clone)]
pub struct MemoryNoticeBus {
    sender: broadcast::Sender<NoticeRecord>,
    backlog: Arc<Mutex<VecDeque<NoticeRecord>>>,
    capacity: usize,
}

impl MemoryNoticeBus {
    /// Creates a new bus retaining at most `capacity` notices (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Snapshot of the retained notices, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NoticeRecord> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained notices of a single kind, oldest first.
    #[must_use]
    pub fn snapshot_of(&self, kind: &str) -> Vec<NoticeRecord> {
        self.backlog
            .lock()
            .iter()
            .filter(|notice| notice.kind == kind)
            .cloned()
            .collect()
    }
}

/// File-backed publisher appending one JSON line per notice.
#[derive(Debug, Clone)]
pub struct FileNoticePublisher {
    path: PathBuf,
}

impl FileNoticePublisher {
    /// Creates a publisher appending to the given path, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NoticePublisher for MemoryNoticeBus {
    async fn publish(&self, notice: NoticeRecord) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(notice.clone());
        }
        // no subscribers is not an error
        let _ = self.sender.send(notice);
        Ok(())
    }
}

#[async_trait]
impl NoticeSubscriber for MemoryNoticeBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<NoticeRecord>> {
        Ok(self.sender.subscribe())
    }
}

#[async_trait]
impl NoticePublisher for FileNoticePublisher {
    async fn publish(&self, notice: NoticeRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&notice)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    fn notice(kind: &str, step: Option<u64>) -> NoticeRecord {
        NoticeRecord {
            id: format!("notice-{kind}"),
            source: "tester".into(),
            kind: kind.into(),
            step,
            timestamp: "2026-01-05T00:00:00Z".into(),
            payload: serde_json::json!({ "events": 1 }),
        }
    }

    #[test]
    fn publishes_and_receives() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryNoticeBus::new(16);
            let mut rx = bus.subscribe().await.unwrap();
            bus.publish(notice("simulation.step.completed", Some(3)))
                .await
                .unwrap();
            let received = rx.recv().await.unwrap();
            assert_eq!(received.kind, "simulation.step.completed");
            assert_eq!(received.step, Some(3));
        });
    }

    #[test]
    fn backlog_is_bounded_and_filterable() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryNoticeBus::new(2);
            bus.publish(notice("scenario.loaded", None)).await.unwrap();
            bus.publish(notice("simulation.step.completed", Some(1)))
                .await
                .unwrap();
            bus.publish(notice("simulation.run.completed", None))
                .await
                .unwrap();
            let kinds: Vec<_> = bus.snapshot().into_iter().map(|n| n.kind).collect();
            assert_eq!(
                kinds,
                vec!["simulation.step.completed", "simulation.run.completed"]
            );
            assert!(bus.snapshot_of("scenario.loaded").is_empty());
        });
    }

    #[test]
    fn file_publisher_appends_lines() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempdir().unwrap();
            let publisher = FileNoticePublisher::new(dir.path().join("notices/run.jsonl")).unwrap();
            publisher.publish(notice("scenario.loaded", None)).await.unwrap();
            publisher
                .publish(notice("simulation.run.completed", None))
                .await
                .unwrap();
            let content = std::fs::read_to_string(publisher.path()).unwrap();
            assert_eq!(content.lines().count(), 2);
            assert!(!content.lines().next().unwrap().contains("\"step\""));
        });
    }
}
