// src/enrich/queue.rs
//! Bounded multi-producer / multi-consumer queue of enrichment tasks.
//!
//! Producers are the per-source collector tasks plus delayed retries;
//! consumers are the workers, which share one receiver behind an async mutex.
//! Nothing is ever dropped: a push that cannot get a slot within the wait
//! hands the task back to the caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::model::Item;

/// One failed attempt, kept for the dead-letter record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub kind: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub item: Arc<Item>,
    /// 1 for the first try.
    pub attempt: u32,
    /// Earliest moment the task may be processed.
    pub not_before: Option<Instant>,
    pub failures: Vec<FailureRecord>,
}

impl EnrichmentTask {
    pub fn new(item: Arc<Item>) -> Self {
        Self {
            item,
            attempt: 1,
            not_before: None,
            failures: Vec::new(),
        }
    }

    /// Same item, next attempt, after recording why this one failed.
    pub fn next_attempt(mut self, attempt: u32, delay: Duration, kind: &str, error: &str) -> Self {
        self.record_failure(kind, error);
        self.attempt = attempt;
        self.not_before = Some(Instant::now() + delay);
        self
    }

    pub fn record_failure(&mut self, kind: &str, error: &str) {
        self.failures.push(FailureRecord {
            attempt: self.attempt,
            kind: kind.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No slot freed up within the wait. The task is handed back.
    #[error("enrichment queue full (waited {waited:?})")]
    Full {
        task: EnrichmentTask,
        waited: Duration,
    },
    #[error("enrichment queue closed")]
    Closed(EnrichmentTask),
}

impl QueueError {
    pub fn into_task(self) -> EnrichmentTask {
        match self {
            QueueError::Full { task, .. } | QueueError::Closed(task) => task,
        }
    }
}

#[derive(Debug)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<EnrichmentTask>,
    rx: Mutex<mpsc::Receiver<EnrichmentTask>>,
    capacity: usize,
    max_depth: AtomicUsize,
}

impl EnrichmentQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        super::ensure_metrics_described();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            max_depth: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently waiting (including slots reserved by in-flight pushes).
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    /// Highest depth observed since start.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    fn after_push(&self) {
        let depth = self.depth();
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        gauge!("enrich_queue_depth").set(depth as f64);
    }

    /// Enqueue, waiting at most `max_wait` for a free slot.
    pub async fn push_within(
        &self,
        task: EnrichmentTask,
        max_wait: Duration,
    ) -> Result<(), QueueError> {
        match tokio::time::timeout(max_wait, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(task);
                self.after_push();
                Ok(())
            }
            Ok(Err(_)) => Err(QueueError::Closed(task)),
            Err(_) => Err(QueueError::Full {
                task,
                waited: max_wait,
            }),
        }
    }

    /// Enqueue, waiting as long as it takes.
    pub async fn push(&self, task: EnrichmentTask) -> Result<(), QueueError> {
        match self.tx.reserve().await {
            Ok(permit) => {
                permit.send(task);
                self.after_push();
                Ok(())
            }
            Err(_) => Err(QueueError::Closed(task)),
        }
    }

    /// Next task, or `None` once the queue is closed and drained.
    /// Cancel-safe: dropping the future never loses a task.
    pub async fn pull(&self) -> Option<EnrichmentTask> {
        let task = self.rx.lock().await.recv().await;
        gauge!("enrich_queue_depth").set(self.depth() as f64);
        task
    }

    /// Next task if one is already waiting; never waits for a producer.
    pub async fn pull_ready(&self) -> Option<EnrichmentTask> {
        let task = self.rx.lock().await.try_recv().ok();
        gauge!("enrich_queue_depth").set(self.depth() as f64);
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Source, SourceKind};

    fn task(title: &str) -> EnrichmentTask {
        let src = Source::new("s", SourceKind::Feed, "https://ex/rss");
        EnrichmentTask::new(Arc::new(Item::new(&src, title, "", None)))
    }

    #[tokio::test]
    async fn fifo_and_depth() {
        let q = EnrichmentQueue::new(4);
        q.push(task("a")).await.unwrap();
        q.push(task("b")).await.unwrap();
        assert_eq!(q.depth(), 2);
        assert_eq!(q.pull().await.unwrap().item.title, "a");
        assert_eq!(q.pull().await.unwrap().item.title, "b");
        assert_eq!(q.depth(), 0);
        assert_eq!(q.max_depth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_hands_task_back() {
        let q = EnrichmentQueue::new(1);
        q.push(task("a")).await.unwrap();
        let err = q
            .push_within(task("b"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full { .. }));
        assert_eq!(err.into_task().item.title, "b");
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn next_attempt_keeps_history() {
        let t = task("a").next_attempt(2, Duration::from_secs(1), "transient", "503");
        assert_eq!(t.attempt, 2);
        assert_eq!(t.failures.len(), 1);
        assert_eq!(t.failures[0].attempt, 1);
        assert!(t.not_before.is_some());
    }
}
