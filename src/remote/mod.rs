//! Shared team records - the multi-writer side of the system
//!
//! Every client reads and writes the same per-team documents. Cross-client
//! mutation only ever happens inside a serializable read-then-write
//! transaction:
//!
//! | Operation                    | Reads                    | Writes                          |
//! |------------------------------|--------------------------|---------------------------------|
//! | `complete_exclusive_activity`| roster + every team doc  | winner entry + points, losers   |
//! | `complete_activity`          | claimant doc             | one entry + points              |
//! | `update_activity_field`      | claimant doc             | one entry (+ optional delta)    |
//!
//! The engine only sees the two traits below, so tests can wrap the real
//! store to inject outages.

mod schema;
mod store;
mod transactions;

pub use store::{SharedStore, TeamChange};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::model::{ActivityKey, ArbitrationResult, CompletionRequest, TeamRecord, UpdateOptions};

/// Live feed of one team's record. The first item is the current state.
pub type SnapshotStream = mpsc::Receiver<Result<TeamRecord, SyncError>>;

/// Transactional writes against the shared team records.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Decide the winner of an exclusive activity.
    async fn complete_exclusive_activity(
        &self,
        request: &CompletionRequest,
    ) -> Result<ArbitrationResult, SyncError>;

    /// Record a non-exclusive completion on the claimant's own record.
    async fn complete_activity(
        &self,
        request: &CompletionRequest,
    ) -> Result<ArbitrationResult, SyncError>;

    /// Merge fields into one activity entry, optionally adjusting points.
    async fn update_activity_field(
        &self,
        key: &ActivityKey,
        fields: Map<String, Value>,
        options: UpdateOptions,
    ) -> Result<TeamRecord, SyncError>;
}

/// Live reads of team records.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn watch(&self, path: &TeamPath) -> Result<SnapshotStream, SyncError>;
}

/// Address of a team record: `events/{eventId}/teams/{teamId}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TeamPath {
    pub event_id: String,
    pub team_id: String,
}

impl TeamPath {
    pub fn new(event_id: impl Into<String>, team_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            team_id: team_id.into(),
        }
    }
}

impl fmt::Display for TeamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "events/{}/teams/{}", self.event_id, self.team_id)
    }
}

impl FromStr for TeamPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["events", event_id, "teams", team_id] if !event_id.is_empty() && !team_id.is_empty() => {
                Ok(Self::new(*event_id, *team_id))
            }
            _ => Err(SyncError::InvalidPath(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_path_parse() {
        let path: TeamPath = "events/ev1/teams/team7".parse().unwrap();
        assert_eq!(path, TeamPath::new("ev1", "team7"));
        assert_eq!(path.to_string(), "events/ev1/teams/team7");

        assert!("/events/ev1/teams/team7/".parse::<TeamPath>().is_ok());
        assert!("events/ev1/teams".parse::<TeamPath>().is_err());
        assert!("events//teams/team7".parse::<TeamPath>().is_err());
    }
}
