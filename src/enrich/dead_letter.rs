// src/enrich/dead_letter.rs
//! Where tasks go when they will not be retried any more.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::queue::{EnrichmentTask, FailureRecord};
use crate::model::Item;

/// Terminal record: the item plus every failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub item: Arc<Item>,
    pub attempts: u32,
    pub reason: String,
    pub failures: Vec<FailureRecord>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_task(task: EnrichmentTask, reason: impl Into<String>) -> Self {
        Self {
            attempts: task.attempt,
            item: task.item,
            reason: reason.into(),
            failures: task.failures,
            dead_lettered_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> std::io::Result<()>;
}

/// Keeps the most recent dead letters in memory.
#[derive(Debug)]
pub struct MemoryDeadLetters {
    inner: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl MemoryDeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDeadLetters {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, letter: &DeadLetter) -> std::io::Result<()> {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(letter.clone());
        while g.len() > self.capacity {
            g.pop_front();
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlDeadLetters {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlDeadLetters {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetters {
    async fn record(&self, letter: &DeadLetter) -> std::io::Result<()> {
        let mut line = serde_json::to_string(letter)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await
    }
}
