//! Local durable store - the client's own write-ahead state
//!
//! Two sled trees survive process restarts:
//!
//! ```text
//! local.sled/
//! ├── completions                 # pending sync jobs, keyed by sequence
//! └── local_completed_activities  # ledger, keyed eventId_teamId_activityId
//! ```
//!
//! When sled cannot be opened the store runs memory-only: completions are
//! still protected for the lifetime of the process, they just don't survive
//! a restart.

pub mod ledger;
pub mod queue;

pub use ledger::CompletionLedger;
pub use queue::{CompletionQueue, QueueStats};

use std::path::Path;
use tracing::{info, warn};

use crate::error::SyncError;

const COMPLETIONS_TREE: &str = "completions";
const LEDGER_TREE: &str = "local_completed_activities";

/// Handle to the local sled database, if one could be opened.
pub struct LocalStore {
    db: Option<sled::Db>,
}

impl LocalStore {
    /// Open or create the local store at `path`
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::Config::new().path(path).open()?;
        info!(path = %path.display(), "Local store opened");

        Ok(Self { db: Some(db) })
    }

    /// Open the store, falling back to memory-only when the disk is unusable
    pub fn open_or_degraded(path: &Path) -> Self {
        match Self::open(path) {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Local store unavailable, completions will not survive a restart"
                );
                Self::memory_only()
            }
        }
    }

    /// Sled-backed store that is deleted on drop (for testing)
    pub fn temporary() -> Result<Self, SyncError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Some(db) })
    }

    /// Store with no persistence at all
    pub fn memory_only() -> Self {
        Self { db: None }
    }

    pub fn is_durable(&self) -> bool {
        self.db.is_some()
    }

    /// Load the completion ledger from its partition
    pub fn ledger(&self) -> CompletionLedger {
        match self.open_tree(LEDGER_TREE) {
            Some(tree) => CompletionLedger::with_persistence(tree),
            None => CompletionLedger::new(),
        }
    }

    /// Load the completion queue from its partition
    pub fn queue(&self) -> CompletionQueue {
        match self.open_tree(COMPLETIONS_TREE) {
            Some(tree) => CompletionQueue::with_persistence(tree),
            None => CompletionQueue::new(),
        }
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<(), SyncError> {
        if let Some(ref db) = self.db {
            db.flush_async().await?;
        }
        Ok(())
    }

    /// Wipe both partitions. Only for an explicit user-initiated cache clear;
    /// live ledgers and queues keep their in-memory copies.
    pub async fn clear_all(&self) -> Result<(), SyncError> {
        let Some(ref db) = self.db else {
            return Ok(());
        };
        for name in [COMPLETIONS_TREE, LEDGER_TREE] {
            db.open_tree(name)?.clear()?;
        }
        db.flush_async().await?;
        info!("Local store cleared");
        Ok(())
    }

    fn open_tree(&self, name: &str) -> Option<sled::Tree> {
        let db = self.db.as_ref()?;
        match db.open_tree(name) {
            Ok(tree) => Some(tree),
            Err(e) => {
                warn!(tree = name, error = %e, "Failed to open local tree, using memory");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityKey, ActivitySnapshot, CompletionJob};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("local.sled");
        let key = ActivityKey::new("ev1", "team7", "42");

        {
            let store = LocalStore::open(&path).unwrap();
            store.ledger().mark(&key, 1_700_000_000).await;
            store
                .queue()
                .push(CompletionJob::new(key.clone(), ActivitySnapshot::new("42", 10, false), true))
                .await;
            store.flush().await.unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert!(store.ledger().is_marked(&key).await);
        assert_eq!(store.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_all_wipes_partitions() {
        let store = LocalStore::temporary().unwrap();
        let key = ActivityKey::new("ev1", "team7", "42");
        store.ledger().mark(&key, 1).await;
        store
            .queue()
            .push(CompletionJob::new(key.clone(), ActivitySnapshot::new("42", 10, false), true))
            .await;

        store.clear_all().await.unwrap();
        assert!(store.ledger().is_empty().await);
        assert!(store.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_only_still_protects() {
        let store = LocalStore::memory_only();
        assert!(!store.is_durable());

        let ledger = store.ledger();
        let key = ActivityKey::new("ev1", "team7", "42");
        ledger.mark(&key, 1).await;
        assert!(ledger.is_marked(&key).await);
    }
}
