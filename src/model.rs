//! Records shared by the queue, the ledger, the shared store and the reconciler.
//!
//! Remote records use camelCase field names, matching the team documents
//! other clients read and write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Unix timestamp in seconds, the unit of `completeTime` on team records.
pub type UnixSeconds = i64;

/// Current time as unix seconds
pub fn now_unix() -> UnixSeconds {
    Utc::now().timestamp()
}

/// Identity of one activity instance held by one team in one event.
///
/// Ordering is (event, team, activity) so a range over a team prefix yields
/// every activity for that team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityKey {
    pub event_id: String,
    pub team_id: String,
    pub activity_id: String,
}

impl ActivityKey {
    pub fn new(
        event_id: impl Into<String>,
        team_id: impl Into<String>,
        activity_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            team_id: team_id.into(),
            activity_id: activity_id.into(),
        }
    }

    /// Composite key used by the local ledger partition: `eventId_teamId_activityId`.
    ///
    /// `_` and `\` inside an id are escaped with `\`, so ids that contain the
    /// separator never share a key.
    pub fn storage_key(&self) -> String {
        format!(
            "{}_{}_{}",
            escape_key_part(&self.event_id),
            escape_key_part(&self.team_id),
            escape_key_part(&self.activity_id)
        )
    }
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for ActivityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.event_id, self.team_id, self.activity_id)
    }
}

/// The activity definition as the client saw it at completion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Points awarded for a successful completion
    #[serde(default)]
    pub points: i64,
    /// Only one team per event may complete this activity
    #[serde(default)]
    pub exclusive: bool,
}

impl ActivitySnapshot {
    pub fn new(id: impl Into<String>, points: i64, exclusive: bool) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            points,
            exclusive,
        }
    }
}

/// A pending sync job in the local completion queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionJob {
    pub id: String,
    pub event_id: String,
    pub team_id: String,
    pub activity_id: String,
    pub activity_snapshot: ActivitySnapshot,
    pub success: bool,
    #[serde(default)]
    pub media: Option<String>,
    /// 0 = not yet valued, 1 = valued
    #[serde(default)]
    pub valorate_value: u8,
    /// Points the client showed optimistically. The sync recomputes the award.
    #[serde(default)]
    pub points_to_add: i64,
    /// Unix seconds at which the team completed the activity
    pub completed_at: UnixSeconds,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl CompletionJob {
    pub fn new(key: ActivityKey, activity: ActivitySnapshot, success: bool) -> Self {
        let points_to_add = crate::award::compute_award(&activity, success, 0);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: key.event_id,
            team_id: key.team_id,
            activity_id: key.activity_id,
            activity_snapshot: activity,
            success,
            media: None,
            valorate_value: 0,
            points_to_add,
            completed_at: now_unix(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
        }
    }

    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }

    pub fn with_valorate(mut self, valorate: u8) -> Self {
        self.valorate_value = valorate;
        self
    }

    pub fn key(&self) -> ActivityKey {
        ActivityKey::new(&self.event_id, &self.team_id, &self.activity_id)
    }

    /// Any attempt on an exclusive activity is arbitrated, failed ones too.
    /// The first recorded attempt closes the activity for every other team.
    pub fn is_exclusive_claim(&self) -> bool {
        self.activity_snapshot.exclusive
    }
}

/// Durable local assertion that an activity was completed on this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCompletionMark {
    pub key: ActivityKey,
    pub completed_at: UnixSeconds,
    /// Advisory only; protection lasts until the mark is cleared.
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub synced_at: Option<UnixSeconds>,
}

/// One activity entry inside a team's shared record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamActivityRecord {
    pub id: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<UnixSeconds>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub valorate: u8,
    #[serde(default)]
    pub awarded_points: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub exclusive: bool,
    /// Fields owned by other collaborators (titles, content refs, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TeamActivityRecord {
    pub fn new(id: impl Into<String>, exclusive: bool) -> Self {
        Self {
            id: id.into(),
            complete: false,
            complete_time: None,
            data: Value::Null,
            valorate: 0,
            awarded_points: 0,
            deleted: false,
            exclusive,
            extra: Map::new(),
        }
    }

    /// Completed and still visible to the team
    pub fn is_live_completion(&self) -> bool {
        self.complete && !self.deleted
    }
}

/// A team's shared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    pub id: String,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub activities: Vec<TeamActivityRecord>,
}

impl TeamRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            points: 0,
            activities: Vec::new(),
        }
    }

    pub fn activity(&self, activity_id: &str) -> Option<&TeamActivityRecord> {
        self.activities.iter().find(|a| a.id == activity_id)
    }

    pub fn activity_mut(&mut self, activity_id: &str) -> Option<&mut TeamActivityRecord> {
        self.activities.iter_mut().find(|a| a.id == activity_id)
    }
}

/// Outcome of a completion transaction. A lost race is a normal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrationResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub already_completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_awarded: Option<i64>,
}

impl ArbitrationResult {
    pub fn accepted(points_awarded: i64) -> Self {
        Self {
            accepted: true,
            already_completed_by: None,
            points_awarded: Some(points_awarded),
        }
    }

    pub fn already_completed_by(team_id: impl Into<String>) -> Self {
        Self {
            accepted: false,
            already_completed_by: Some(team_id.into()),
            points_awarded: None,
        }
    }
}

/// Everything a completion transaction needs, independent of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub key: ActivityKey,
    pub activity: ActivitySnapshot,
    pub success: bool,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub valorate: u8,
    /// Explicit award for the entry. `None` recomputes it from the activity.
    #[serde(default)]
    pub points_to_add: Option<i64>,
    pub completed_at: UnixSeconds,
}

impl CompletionRequest {
    /// Submission payload stored in the entry's `data` field
    pub fn submission(&self) -> Value {
        serde_json::json!({
            "success": self.success,
            "media": self.media,
        })
    }
}

impl From<&CompletionJob> for CompletionRequest {
    fn from(job: &CompletionJob) -> Self {
        Self {
            key: job.key(),
            activity: job.activity_snapshot.clone(),
            success: job.success,
            media: job.media.clone(),
            valorate: job.valorate_value,
            points_to_add: None,
            completed_at: job.completed_at,
        }
    }
}

/// Options for a single-entry update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOptions {
    /// Added to the team's points as read inside the transaction
    #[serde(default)]
    pub points_to_add: Option<i64>,
    /// Entry fields removed after the merge, e.g. `deleted` on restore
    #[serde(default)]
    pub fields_to_delete: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        let key = ActivityKey::new("ev1", "team7", "42");
        assert_eq!(key.storage_key(), "ev1_team7_42");
        assert_eq!(key.to_string(), "ev1/team7/42");
    }

    #[test]
    fn test_storage_key_escapes_separator() {
        let left = ActivityKey::new("a_b", "c", "d");
        let right = ActivityKey::new("a", "b_c", "d");
        assert_ne!(left.storage_key(), right.storage_key());
        assert_eq!(left.storage_key(), r"a\_b_c_d");

        let slash = ActivityKey::new(r"a\", "b", "c");
        let underscore = ActivityKey::new("a", "_b", "c");
        assert_ne!(slash.storage_key(), underscore.storage_key());
    }

    #[test]
    fn test_activity_record_wire_format() {
        let raw = serde_json::json!({
            "id": "42",
            "complete": true,
            "completeTime": 1700000000,
            "valorate": 1,
            "awardedPoints": 10,
            "title": "Find the statue"
        });
        let record: TeamActivityRecord = serde_json::from_value(raw).unwrap();
        assert!(record.is_live_completion());
        assert_eq!(record.complete_time, Some(1_700_000_000));
        assert_eq!(record.awarded_points, 10);
        assert_eq!(record.extra.get("title"), Some(&Value::from("Find the statue")));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["title"], "Find the statue");
        assert_eq!(back["deleted"], false);
    }

    #[test]
    fn test_job_points_follow_result() {
        let key = ActivityKey::new("ev1", "team7", "42");
        let ok = CompletionJob::new(key.clone(), ActivitySnapshot::new("42", 10, false), true);
        assert_eq!(ok.points_to_add, 10);
        assert!(!ok.is_exclusive_claim());

        let failed = CompletionJob::new(key, ActivitySnapshot::new("42", 10, true), false);
        assert_eq!(failed.points_to_add, 0);
        assert!(failed.is_exclusive_claim());
    }
}
