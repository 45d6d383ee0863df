//! Completion Queue - local write-ahead log of pending sync jobs
//!
//! Jobs are keyed by a monotonically increasing sequence number so iteration
//! order is insertion order, both in memory and in the sled tree (big-endian
//! keys sort numerically). No uniqueness is enforced here: two attempts at the
//! same activity are two jobs, and the completion transaction makes the second
//! one a no-op.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::CompletionJob;

/// Queue introspection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retrying: usize,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    pub max_retry_count: u32,
}

pub struct CompletionQueue {
    jobs: RwLock<BTreeMap<u64, CompletionJob>>,
    db: Option<sled::Tree>,
    next_seq: AtomicU64,
}

impl CompletionQueue {
    /// Create a new in-memory queue
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            db: None,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Create a queue with persistence, reloading jobs left by a previous run
    pub fn with_persistence(db: sled::Tree) -> Self {
        let mut jobs = BTreeMap::new();
        for item in db.iter() {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(error = %e, "Completion queue scan failed");
                    continue;
                }
            };
            let Ok(seq_bytes) = <[u8; 8]>::try_from(&key[..]) else {
                warn!("Skipping completion job with malformed key");
                continue;
            };
            match rmp_serde::from_slice::<CompletionJob>(&value) {
                Ok(job) => {
                    jobs.insert(u64::from_be_bytes(seq_bytes), job);
                }
                Err(e) => warn!(error = %e, "Skipping unreadable completion job"),
            }
        }

        let next_seq = jobs.keys().next_back().map_or(1, |last| last + 1);
        info!(count = jobs.len(), "CompletionQueue loaded pending jobs");

        Self {
            jobs: RwLock::new(jobs),
            db: Some(db),
            next_seq: AtomicU64::new(next_seq),
        }
    }

    /// Append a job. Returns its sequence number.
    pub async fn push(&self, job: CompletionJob) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.persist(seq, &job);
        debug!(seq, job_id = %job.id, key = %job.key(), "Completion job queued");
        self.jobs.write().await.insert(seq, job);
        seq
    }

    /// Snapshot of pending jobs in insertion order
    pub async fn pending(&self) -> Vec<(u64, CompletionJob)> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(seq, job)| (*seq, job.clone()))
            .collect()
    }

    /// Replace a job's stored state (retry bookkeeping)
    pub async fn update(&self, seq: u64, job: CompletionJob) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(slot) = jobs.get_mut(&seq) else {
            return false;
        };
        self.persist(seq, &job);
        *slot = job;
        true
    }

    /// Remove a job. Returns `false` if it was already gone.
    pub async fn remove(&self, seq: u64) -> bool {
        let removed = self.jobs.write().await.remove(&seq).is_some();
        if removed {
            if let Some(ref db) = self.db {
                if let Err(e) = db.remove(seq.to_be_bytes()) {
                    warn!(seq, error = %e, "Failed to remove completion job from disk");
                }
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn stats(&self) -> QueueStats {
        let jobs = self.jobs.read().await;
        QueueStats {
            pending: jobs.len(),
            retrying: jobs.values().filter(|j| j.retry_count > 0).count(),
            oldest_enqueued_at: jobs.values().map(|j| j.enqueued_at).min(),
            max_retry_count: jobs.values().map(|j| j.retry_count).max().unwrap_or(0),
        }
    }

    /// Drop every job (explicit cache clear)
    pub async fn clear_all(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let count = jobs.len();
        jobs.clear();
        if let Some(ref db) = self.db {
            if let Err(e) = db.clear() {
                warn!(error = %e, "Failed to clear completion queue on disk");
            }
        }
        info!(count, "Completion queue cleared");
        count
    }

    fn persist(&self, seq: u64, job: &CompletionJob) {
        let Some(ref db) = self.db else {
            return;
        };
        let bytes = match rmp_serde::to_vec_named(job) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(seq, error = %e, "Failed to encode completion job");
                return;
            }
        };
        if let Err(e) = db.insert(seq.to_be_bytes(), bytes) {
            warn!(seq, error = %e, "Completion job write failed, keeping it in memory");
        }
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}
