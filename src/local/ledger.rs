//! Completion Ledger - the local one-way completion ratchet
//!
//! A mark is written the moment a team completes an activity and stays until
//! the shared record itself reports the completion (or the team loses an
//! exclusive race). While a mark exists the reconciler shows the activity as
//! complete, whatever the remote side currently says.
//!
//! Persistence failures are logged and the mark is kept in memory.

use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::{now_unix, ActivityKey, LocalCompletionMark, UnixSeconds};

pub struct CompletionLedger {
    /// Marks ordered by (event, team, activity)
    marks: RwLock<BTreeMap<ActivityKey, LocalCompletionMark>>,
    /// Persistent storage (optional sled tree)
    db: Option<sled::Tree>,
}

impl CompletionLedger {
    /// Create a new in-memory ledger
    pub fn new() -> Self {
        Self {
            marks: RwLock::new(BTreeMap::new()),
            db: None,
        }
    }

    /// Create a ledger with persistence
    pub fn with_persistence(db: sled::Tree) -> Self {
        let mut marks = BTreeMap::new();
        for item in db.iter() {
            match item {
                Ok((_, value)) => match rmp_serde::from_slice::<LocalCompletionMark>(&value) {
                    Ok(mark) => {
                        marks.insert(mark.key.clone(), mark);
                    }
                    Err(e) => warn!(error = %e, "Skipping unreadable ledger entry"),
                },
                Err(e) => warn!(error = %e, "Ledger scan failed"),
            }
        }

        info!(count = marks.len(), "CompletionLedger loaded marks");

        Self {
            marks: RwLock::new(marks),
            db: Some(db),
        }
    }

    /// Record a completion. Marking an already-marked tuple keeps the
    /// original completion time.
    pub async fn mark(&self, key: &ActivityKey, completed_at: UnixSeconds) -> LocalCompletionMark {
        let mut marks = self.marks.write().await;
        if let Some(existing) = marks.get(key) {
            return existing.clone();
        }

        let mark = LocalCompletionMark {
            key: key.clone(),
            completed_at,
            synced: false,
            synced_at: None,
        };
        marks.insert(key.clone(), mark.clone());
        self.persist(&mark);

        debug!(key = %key, completed_at, "Completion marked");
        mark
    }

    pub async fn is_marked(&self, key: &ActivityKey) -> bool {
        self.marks.read().await.contains_key(key)
    }

    pub async fn get(&self, key: &ActivityKey) -> Option<LocalCompletionMark> {
        self.marks.read().await.get(key).cloned()
    }

    /// Every mark held for one team in one event
    pub async fn list_for_team(&self, event_id: &str, team_id: &str) -> Vec<LocalCompletionMark> {
        let start = ActivityKey::new(event_id, team_id, "");
        self.marks
            .read()
            .await
            .range(start..)
            .take_while(|(k, _)| k.event_id == event_id && k.team_id == team_id)
            .map(|(_, mark)| mark.clone())
            .collect()
    }

    /// Note that the sync went through. Does not lift protection.
    pub async fn mark_synced(&self, key: &ActivityKey) -> bool {
        let mut marks = self.marks.write().await;
        let Some(mark) = marks.get_mut(key) else {
            return false;
        };
        mark.synced = true;
        mark.synced_at = Some(now_unix());
        let mark = mark.clone();
        self.persist(&mark);
        true
    }

    /// Lift protection for a tuple. Returns whether a mark existed.
    pub async fn clear(&self, key: &ActivityKey) -> bool {
        let existed = self.marks.write().await.remove(key).is_some();
        if existed {
            if let Some(ref db) = self.db {
                if let Err(e) = db.remove(key.storage_key().as_bytes()) {
                    warn!(key = %key, error = %e, "Failed to remove ledger entry from disk");
                }
            }
            debug!(key = %key, "Completion mark cleared");
        }
        existed
    }

    /// Drop every mark (explicit cache clear)
    pub async fn clear_all(&self) -> usize {
        let mut marks = self.marks.write().await;
        let count = marks.len();
        marks.clear();
        if let Some(ref db) = self.db {
            if let Err(e) = db.clear() {
                warn!(error = %e, "Failed to clear ledger on disk");
            }
        }
        info!(count, "Ledger cleared");
        count
    }

    pub async fn len(&self) -> usize {
        self.marks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.marks.read().await.is_empty()
    }

    fn persist(&self, mark: &LocalCompletionMark) {
        let Some(ref db) = self.db else {
            return;
        };
        let bytes = match rmp_serde::to_vec_named(mark) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %mark.key, error = %e, "Failed to encode ledger entry");
                return;
            }
        };
        if let Err(e) = db.insert(mark.key.storage_key().as_bytes(), bytes) {
            warn!(key = %mark.key, error = %e, "Ledger write failed, keeping mark in memory");
        }
    }
}

impl Default for CompletionLedger {
    fn default() -> Self {
        Self::new()
    }
}
