//! SQLite-backed shared store
//!
//! SQLite allows a single writer at a time, so an IMMEDIATE transaction that
//! reads and then writes is serializable: two racing claimants are ordered,
//! and the second one sees the first one's commit. Several `SharedStore`
//! handles (one per client) may open the same file; a writer that cannot get
//! the lock within the busy timeout fails with [`SyncError::Busy`], which the
//! queue retries.
//!
//! Live reads follow two feeds. Commits made through this handle are
//! published on a broadcast channel as they happen. Commits made through any
//! other handle on the same file are picked up by polling `teams.version`.
//! Both carry the committed version, so a watcher never sees a document twice
//! or goes back to an older one.

use async_trait::async_trait;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::schema;
use super::transactions::{self, EntryPatch};
use super::{CompletionBackend, SnapshotSource, SnapshotStream, TeamPath};
use crate::error::SyncError;
use crate::model::{
    ActivityKey, ArbitrationResult, CompletionRequest, TeamActivityRecord, TeamRecord,
    UpdateOptions,
};

const DEFAULT_FEED_CAPACITY: usize = 256;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A team document as committed by some transaction
#[derive(Debug, Clone)]
pub struct TeamChange {
    pub event_id: String,
    pub record: TeamRecord,
    /// `teams.version` after the commit
    pub version: i64,
}

struct Inner {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<TeamChange>,
}

/// Handle to the shared team database. Cheap to clone.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Inner>,
    poll_interval: Duration,
}

impl SharedStore {
    /// Open or create the shared database at `path`
    pub fn open(path: &Path, busy_timeout: Duration, feed_capacity: usize) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening shared store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(busy_timeout)?;

        Self::from_connection(conn, feed_capacity)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, SyncError> {
        debug!("Opening in-memory shared store");
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_FEED_CAPACITY)
    }

    fn from_connection(conn: Connection, feed_capacity: usize) -> Result<Self, SyncError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;

        let (changes, _) = broadcast::channel(feed_capacity.max(1));
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                changes,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often watchers check for commits made through other handles
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Raw feed of committed team documents
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TeamChange> {
        self.inner.changes.subscribe()
    }

    /// Run `body` in an IMMEDIATE transaction and publish the documents it
    /// changed once it commits.
    async fn write_tx<T, F>(&self, body: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<(T, Vec<TeamChange>), SyncError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner
                .conn
                .lock()
                .map_err(|e| SyncError::Internal(format!("Lock poisoned: {}", e)))?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (value, changes) = body(&tx)?;
            tx.commit()?;

            // Published under the lock so subscribers see commit order
            for change in changes {
                let _ = inner.changes.send(change);
            }
            Ok(value)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("Shared store task failed: {}", e)))?
    }

    async fn read<T, F>(&self, body: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, SyncError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let conn = inner
                .conn
                .lock()
                .map_err(|e| SyncError::Internal(format!("Lock poisoned: {}", e)))?;
            body(&conn)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("Shared store task failed: {}", e)))?
    }

    // =========================================================================
    // Event setup
    // =========================================================================

    /// Create an event if it doesn't exist
    pub async fn create_event(&self, event_id: &str, name: &str) -> Result<(), SyncError> {
        let (event_id, name) = (event_id.to_string(), name.to_string());
        self.write_tx(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO events (id, name) VALUES (?, ?)",
                params![event_id, name],
            )?;
            Ok(((), Vec::new()))
        })
        .await
    }

    /// Put a team on an event's roster with an empty document
    pub async fn add_team(
        &self,
        event_id: &str,
        team_id: &str,
        points: i64,
    ) -> Result<TeamRecord, SyncError> {
        let (event_id, team_id) = (event_id.to_string(), team_id.to_string());
        self.write_tx(move |tx| {
            transactions::load_roster(tx, &event_id)?;
            tx.execute(
                "INSERT OR IGNORE INTO event_teams (event_id, team_id) VALUES (?, ?)",
                params![event_id, team_id],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO teams (event_id, team_id, points) VALUES (?, ?, ?)",
                params![event_id, team_id, points],
            )?;
            let (record, version) = transactions::load_versioned_team(tx, &event_id, &team_id)?
                .unwrap_or_else(|| (TeamRecord::new(&team_id), 0));
            let change = TeamChange {
                event_id,
                record: record.clone(),
                version,
            };
            Ok((record, vec![change]))
        })
        .await
    }

    /// Give a team an activity, replacing any entry with the same id
    pub async fn assign_activity(
        &self,
        event_id: &str,
        team_id: &str,
        entry: TeamActivityRecord,
    ) -> Result<TeamRecord, SyncError> {
        let (event_id, team_id) = (event_id.to_string(), team_id.to_string());
        self.write_tx(move |tx| {
            let mut team = transactions::load_team(tx, &event_id, &team_id)?.ok_or_else(|| {
                SyncError::TeamNotFound {
                    event_id: event_id.clone(),
                    team_id: team_id.clone(),
                }
            })?;
            match team.activity_mut(&entry.id) {
                Some(existing) => *existing = entry,
                None => team.activities.push(entry),
            }
            let change = transactions::write_team(tx, &event_id, &team)?;
            Ok((team, vec![change]))
        })
        .await
    }

    pub async fn team_record(
        &self,
        event_id: &str,
        team_id: &str,
    ) -> Result<Option<TeamRecord>, SyncError> {
        let (event_id, team_id) = (event_id.to_string(), team_id.to_string());
        self.read(move |conn| transactions::load_team(conn, &event_id, &team_id))
            .await
    }

    /// The team document if its version moved past `seen`
    async fn team_if_newer(
        &self,
        path: &TeamPath,
        seen: i64,
    ) -> Result<Option<(TeamRecord, i64)>, SyncError> {
        let path = path.clone();
        self.read(move |conn| {
            let version = transactions::team_version(conn, &path.event_id, &path.team_id)?
                .ok_or_else(|| SyncError::TeamNotFound {
                    event_id: path.event_id.clone(),
                    team_id: path.team_id.clone(),
                })?;
            if version <= seen {
                return Ok(None);
            }
            transactions::load_versioned_team(conn, &path.event_id, &path.team_id)
        })
        .await
    }

    /// Every team document on an event's roster
    pub async fn list_teams(&self, event_id: &str) -> Result<Vec<TeamRecord>, SyncError> {
        let event_id = event_id.to_string();
        self.read(move |conn| {
            let roster = transactions::load_roster(conn, &event_id)?;
            let mut teams = Vec::with_capacity(roster.len());
            for team_id in roster {
                if let Some(team) = transactions::load_team(conn, &event_id, &team_id)? {
                    teams.push(team);
                }
            }
            Ok(teams)
        })
        .await
    }

    // =========================================================================
    // Admin edits (single-entry updates)
    // =========================================================================

    /// Manual valuation: set the entry's award and move the team total by the
    /// difference to what it previously awarded.
    pub async fn set_valuation(
        &self,
        key: &ActivityKey,
        valorate: u8,
        awarded_points: i64,
    ) -> Result<TeamRecord, SyncError> {
        let key = key.clone();
        self.write_tx(move |tx| {
            transactions::update_entry(tx, &key, |entry| {
                let mut fields = Map::new();
                fields.insert("valorate".into(), json!(valorate));
                fields.insert("awardedPoints".into(), json!(awarded_points));
                Ok(EntryPatch {
                    fields,
                    fields_to_delete: Vec::new(),
                    points_delta: awarded_points - entry.awarded_points,
                })
            })
        })
        .await
    }

    /// Hide an activity from the team
    pub async fn delete_activity(&self, key: &ActivityKey) -> Result<TeamRecord, SyncError> {
        let mut fields = Map::new();
        fields.insert("deleted".into(), Value::Bool(true));
        self.update_activity_field(key, fields, UpdateOptions::default())
            .await
    }

    /// Bring a deleted activity back
    pub async fn restore_activity(&self, key: &ActivityKey) -> Result<TeamRecord, SyncError> {
        let options = UpdateOptions {
            points_to_add: None,
            fields_to_delete: vec!["deleted".to_string()],
        };
        self.update_activity_field(key, Map::new(), options).await
    }
}

#[async_trait]
impl CompletionBackend for SharedStore {
    async fn complete_exclusive_activity(
        &self,
        request: &CompletionRequest,
    ) -> Result<ArbitrationResult, SyncError> {
        let request = request.clone();
        self.write_tx(move |tx| transactions::complete_exclusive(tx, &request))
            .await
    }

    async fn complete_activity(
        &self,
        request: &CompletionRequest,
    ) -> Result<ArbitrationResult, SyncError> {
        let request = request.clone();
        self.write_tx(move |tx| transactions::complete_activity(tx, &request))
            .await
    }

    async fn update_activity_field(
        &self,
        key: &ActivityKey,
        fields: Map<String, Value>,
        options: UpdateOptions,
    ) -> Result<TeamRecord, SyncError> {
        let key = key.clone();
        self.write_tx(move |tx| transactions::update_activity_field(tx, &key, fields, options))
            .await
    }
}

#[async_trait]
impl SnapshotSource for SharedStore {
    async fn watch(&self, path: &TeamPath) -> Result<SnapshotStream, SyncError> {
        // Subscribe before the initial read so no commit falls in between
        let mut changes = self.subscribe_changes();
        let (initial, mut seen) = self
            .team_if_newer(path, i64::MIN)
            .await?
            .ok_or_else(|| SyncError::TeamNotFound {
                event_id: path.event_id.clone(),
                team_id: path.team_id.clone(),
            })?;

        let (tx, rx) = mpsc::channel(16);
        tx.send(Ok(initial))
            .await
            .map_err(|_| SyncError::SubscriptionClosed(path.to_string()))?;

        let store = self.clone();
        let path = path.clone();
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(store.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if change.event_id != path.event_id
                                || change.record.id != path.team_id
                                || change.version <= seen
                            {
                                continue;
                            }
                            Ok((change.record, change.version))
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(path = %path, skipped, "Change feed lagged, forcing resubscribe");
                            Err(SyncError::Unavailable(format!(
                                "change feed lagged by {} updates",
                                skipped
                            )))
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = poll.tick() => match store.team_if_newer(&path, seen).await {
                        Ok(Some(versioned)) => Ok(versioned),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                };

                match next {
                    Ok((record, version)) => {
                        seen = version;
                        if tx.send(Ok(record)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            debug!(path = %path, "Change feed forwarder ended");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now_unix, ActivitySnapshot};

    async fn seeded_store(teams: &[&str], activity: &str, exclusive: bool) -> SharedStore {
        let store = SharedStore::open_in_memory().unwrap();
        store.create_event("ev1", "Treasure hunt").await.unwrap();
        for team in teams {
            store.add_team("ev1", team, 0).await.unwrap();
            store
                .assign_activity("ev1", team, TeamActivityRecord::new(activity, exclusive))
                .await
                .unwrap();
        }
        store
    }

    fn request(team: &str, activity: &str, points: i64, exclusive: bool) -> CompletionRequest {
        CompletionRequest {
            key: ActivityKey::new("ev1", team, activity),
            activity: ActivitySnapshot::new(activity, points, exclusive),
            success: true,
            media: Some("photo-1.jpg".into()),
            valorate: 1,
            points_to_add: None,
            completed_at: now_unix(),
        }
    }

    #[tokio::test]
    async fn test_exclusive_winner_and_losers() {
        let store = seeded_store(&["3", "9", "11"], "5", true).await;

        let first = store
            .complete_exclusive_activity(&request("3", "5", 20, true))
            .await
            .unwrap();
        assert_eq!(first, ArbitrationResult::accepted(20));

        let second = store
            .complete_exclusive_activity(&request("9", "5", 20, true))
            .await
            .unwrap();
        assert_eq!(second, ArbitrationResult::already_completed_by("3"));

        let winner = store.team_record("ev1", "3").await.unwrap().unwrap();
        let entry = winner.activity("5").unwrap();
        assert!(entry.is_live_completion());
        assert_eq!(entry.awarded_points, 20);
        assert_eq!(entry.data["media"], "photo-1.jpg");
        assert_eq!(winner.points, 20);

        for loser in ["9", "11"] {
            let team = store.team_record("ev1", loser).await.unwrap().unwrap();
            assert!(team.activity("5").unwrap().deleted);
            assert_eq!(team.points, 0);
        }
    }

    #[tokio::test]
    async fn test_exclusive_replay_awards_once() {
        let store = seeded_store(&["3", "9"], "5", true).await;
        let req = request("3", "5", 20, true);

        store.complete_exclusive_activity(&req).await.unwrap();
        let replay = store.complete_exclusive_activity(&req).await.unwrap();
        assert_eq!(replay, ArbitrationResult::accepted(0));

        let winner = store.team_record("ev1", "3").await.unwrap().unwrap();
        assert_eq!(winner.points, 20);
    }

    #[tokio::test]
    async fn test_failed_exclusive_attempt_closes_activity() {
        let store = seeded_store(&["3", "9", "11"], "5", true).await;
        let mut failed = request("3", "5", 20, true);
        failed.success = false;

        let first = store.complete_exclusive_activity(&failed).await.unwrap();
        assert_eq!(first, ArbitrationResult::accepted(0));

        let second = store
            .complete_exclusive_activity(&request("9", "5", 20, true))
            .await
            .unwrap();
        assert_eq!(second, ArbitrationResult::already_completed_by("3"));

        let teams = store.list_teams("ev1").await.unwrap();
        let live: Vec<&str> = teams
            .iter()
            .filter(|t| t.activity("5").unwrap().is_live_completion())
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(live, vec!["3"]);

        for team in &teams {
            let entry = team.activity("5").unwrap();
            assert_eq!(team.points, 0);
            if team.id == "3" {
                assert_eq!(entry.awarded_points, 0);
                assert_eq!(entry.data["success"], false);
            } else {
                assert!(entry.deleted);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_team_is_integrity_error() {
        let store = seeded_store(&["3"], "5", true).await;

        let err = store
            .complete_exclusive_activity(&request("404", "5", 20, true))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TeamNotFound { .. }));
        assert!(!err.is_retryable());

        let mut missing_event = request("3", "5", 20, true);
        missing_event.key.event_id = "nope".into();
        let err = store
            .complete_exclusive_activity(&missing_event)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::EventNotFound(_)));
    }

    #[tokio::test]
    async fn test_non_exclusive_completion_is_idempotent() {
        let store = seeded_store(&["7"], "42", false).await;
        let req = request("7", "42", 10, false);

        let first = store.complete_activity(&req).await.unwrap();
        let second = store.complete_activity(&req).await.unwrap();
        assert_eq!(first.points_awarded, Some(10));
        assert_eq!(second.points_awarded, Some(0));

        let team = store.team_record("ev1", "7").await.unwrap().unwrap();
        assert_eq!(team.points, 10);
        assert_eq!(team.activity("42").unwrap().complete_time, Some(req.completed_at));
    }

    #[tokio::test]
    async fn test_missing_activity_entry() {
        let store = seeded_store(&["7"], "42", false).await;
        let err = store
            .complete_activity(&request("7", "missing", 10, false))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ActivityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_admin_edits() {
        let store = seeded_store(&["7"], "42", false).await;
        let key = ActivityKey::new("ev1", "7", "42");
        store.complete_activity(&request("7", "42", 10, false)).await.unwrap();

        let team = store.set_valuation(&key, 1, 25).await.unwrap();
        assert_eq!(team.points, 25);
        assert_eq!(team.activity("42").unwrap().awarded_points, 25);

        let team = store.delete_activity(&key).await.unwrap();
        assert!(team.activity("42").unwrap().deleted);

        let team = store.restore_activity(&key).await.unwrap();
        assert!(!team.activity("42").unwrap().deleted);
        assert_eq!(team.points, 25);

        let team = store
            .update_activity_field(
                &key,
                Map::new(),
                UpdateOptions {
                    points_to_add: Some(-5),
                    fields_to_delete: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(team.points, 20);
    }

    #[tokio::test]
    async fn test_watch_delivers_initial_and_changes() {
        let store = seeded_store(&["7", "8"], "42", false).await;
        let mut stream = store.watch(&TeamPath::new("ev1", "7")).await.unwrap();

        let initial = stream.recv().await.unwrap().unwrap();
        assert!(!initial.activity("42").unwrap().complete);

        store.complete_activity(&request("8", "42", 10, false)).await.unwrap();
        store.complete_activity(&request("7", "42", 10, false)).await.unwrap();

        let update = stream.recv().await.unwrap().unwrap();
        assert_eq!(update.id, "7");
        assert!(update.activity("42").unwrap().complete);
    }

    #[tokio::test]
    async fn test_watch_sees_commits_from_other_handles() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("shared.db");
        let writer = SharedStore::open(&path, Duration::from_secs(5), 16).unwrap();
        writer.create_event("ev1", "Treasure hunt").await.unwrap();
        for team in ["3", "9"] {
            writer.add_team("ev1", team, 0).await.unwrap();
            writer
                .assign_activity("ev1", team, TeamActivityRecord::new("5", true))
                .await
                .unwrap();
        }

        let reader = SharedStore::open(&path, Duration::from_secs(5), 16)
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let mut stream = reader.watch(&TeamPath::new("ev1", "9")).await.unwrap();
        let initial = stream.recv().await.unwrap().unwrap();
        assert!(!initial.activity("5").unwrap().deleted);

        writer
            .complete_exclusive_activity(&request("3", "5", 20, true))
            .await
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(update.id, "9");
        assert!(update.activity("5").unwrap().deleted);

        // One commit, one delivery
        let quiet = tokio::time::timeout(Duration::from_millis(100), stream.recv()).await;
        assert!(quiet.is_err());
    }
}
