//! Append-only failure log.
//!
//! Records every task whose first answer was not accepted as-is: corrected,
//! flagged, or failed. Entries are kept in memory and, when a path is
//! configured, appended to a JSON Lines file one whole line per write.
//! A file-backed log keeps only the most recent entries in memory.
//! Appends from concurrent tasks are serialized; ordering across tasks is
//! by arrival, and timestamps are the recovery key.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::orchestrator::Stage;
use super::task::{TaskId, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLogEntry {
    pub task_id: TaskId,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FailureLogEntry {
    pub fn verdict(task_id: TaskId, stage: Stage, verdict: Verdict) -> Self {
        Self {
            task_id,
            stage,
            verdict: Some(verdict),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(task_id: TaskId, stage: Stage, error: impl Into<String>) -> Self {
        Self {
            task_id,
            stage,
            verdict: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// In-memory entries kept by a file-backed log.
pub const DEFAULT_MEMORY_LIMIT: usize = 1024;

pub struct FailureLog {
    entries: StdMutex<VecDeque<FailureLogEntry>>,
    memory_limit: Option<usize>,
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl FailureLog {
    /// Unbounded log kept only in memory.
    pub fn in_memory() -> Self {
        Self {
            entries: StdMutex::new(VecDeque::new()),
            memory_limit: None,
            sink: None,
        }
    }

    /// Keep at most `limit` entries in memory, dropping the oldest first.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Log that also appends to `path`, creating it (and parents) if needed.
    pub async fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            entries: StdMutex::new(VecDeque::new()),
            memory_limit: Some(DEFAULT_MEMORY_LIMIT),
            sink: Some((path, Mutex::new(file))),
        })
    }

    /// Read every entry from a log file. Unparseable lines are skipped.
    pub async fn read_file(path: &Path) -> std::io::Result<Vec<FailureLogEntry>> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping malformed failure log line: {}", e);
                    None
                }
            })
            .collect())
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(path, _)| path.as_path())
    }

    /// Append one entry.
    ///
    /// The in-memory record is always kept (subject to the memory limit);
    /// a file write error is returned to the caller.
    pub async fn append(&self, entry: FailureLogEntry) -> std::io::Result<()> {
        tracing::debug!(
            task_id = %entry.task_id,
            stage = ?entry.stage,
            "Recording failure log entry"
        );

        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push_back(entry.clone());
            if let Some(limit) = self.memory_limit {
                while entries.len() > limit {
                    entries.pop_front();
                }
            }
        }

        if let Some((_, file)) = &self.sink {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let mut file = file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Entries held in memory, oldest first.
    pub fn entries(&self) -> Vec<FailureLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_appends_produce_whole_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("failures.jsonl");
        let log = Arc::new(FailureLog::open(path.clone()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(FailureLogEntry::error(
                    TaskId::from(format!("task-{}", i)),
                    Stage::Generate,
                    "timeout",
                ))
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(log.len(), 32);
        let on_disk = FailureLog::read_file(&path).await.unwrap();
        assert_eq!(on_disk.len(), 32);
    }

    #[tokio::test]
    async fn test_entry_serialization_omits_empty_fields() {
        let entry = FailureLogEntry::verdict(TaskId::from("t1"), Stage::Verify, Verdict::Unverifiable);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"verdict\":\"Unverifiable\""));
        assert!(!json.contains("\"error\""));
    }

    #[tokio::test]
    async fn test_in_memory_log() {
        let log = FailureLog::in_memory();
        assert!(log.is_empty());
        log.append(FailureLogEntry::error(TaskId::from("t"), Stage::Retrieve, "down"))
            .await
            .unwrap();
        assert_eq!(log.entries()[0].error.as_deref(), Some("down"));
        assert!(log.path().is_none());
    }

    #[tokio::test]
    async fn test_memory_limit_drops_oldest() {
        let log = FailureLog::in_memory().with_memory_limit(2);
        for i in 0..5 {
            log.append(FailureLogEntry::error(
                TaskId::from(format!("task-{}", i)),
                Stage::Generate,
                "timeout",
            ))
            .await
            .unwrap();
        }
        let ids: Vec<_> = log.entries().iter().map(|e| e.task_id.to_string()).collect();
        assert_eq!(ids, vec!["task-3", "task-4"]);
    }

    #[tokio::test]
    async fn test_append_survives_poisoned_mirror() {
        let log = Arc::new(FailureLog::in_memory());
        let poisoner = log.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the mirror");
        })
        .join();
        assert!(log.entries.is_poisoned());

        log.append(FailureLogEntry::error(TaskId::from("t"), Stage::Verify, "late"))
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].task_id.as_str(), "t");
    }
}
