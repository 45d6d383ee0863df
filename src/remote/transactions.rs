//! Read-then-write transaction bodies for the shared store
//!
//! Each function runs inside an IMMEDIATE transaction opened by
//! [`SharedStore`](super::SharedStore), so the reads it makes cannot be
//! invalidated before its writes commit. Points are always adjusted as
//! `current + delta` on the value read here.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::store::TeamChange;
use crate::award::compute_award;
use crate::error::SyncError;
use crate::model::{
    ActivityKey, ArbitrationResult, CompletionRequest, TeamActivityRecord, TeamRecord,
    UpdateOptions,
};

/// Field-level change to a single activity entry.
#[derive(Debug, Default)]
pub struct EntryPatch {
    pub fields: Map<String, Value>,
    pub fields_to_delete: Vec<String>,
    pub points_delta: i64,
}

/// Team ids on an event's roster. Fails if the event itself is missing.
pub fn load_roster(conn: &Connection, event_id: &str) -> Result<Vec<String>, SyncError> {
    let exists: Option<String> = conn
        .query_row("SELECT id FROM events WHERE id = ?", params![event_id], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(SyncError::EventNotFound(event_id.to_string()));
    }

    let mut stmt =
        conn.prepare("SELECT team_id FROM event_teams WHERE event_id = ? ORDER BY team_id")?;
    let roster = stmt
        .query_map(params![event_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(roster)
}

pub fn load_team(
    conn: &Connection,
    event_id: &str,
    team_id: &str,
) -> Result<Option<TeamRecord>, SyncError> {
    Ok(load_versioned_team(conn, event_id, team_id)?.map(|(team, _)| team))
}

/// A team document together with its commit version
pub fn load_versioned_team(
    conn: &Connection,
    event_id: &str,
    team_id: &str,
) -> Result<Option<(TeamRecord, i64)>, SyncError> {
    let row: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT points, activities_json, version FROM teams WHERE event_id = ? AND team_id = ?",
            params![event_id, team_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        Some((points, activities_json, version)) => Ok(Some((
            TeamRecord {
                id: team_id.to_string(),
                points,
                activities: serde_json::from_str(&activities_json)?,
            },
            version,
        ))),
        None => Ok(None),
    }
}

/// Commit version of a team document, bumped by every write
pub fn team_version(conn: &Connection, event_id: &str, team_id: &str) -> Result<Option<i64>, SyncError> {
    Ok(conn
        .query_row(
            "SELECT version FROM teams WHERE event_id = ? AND team_id = ?",
            params![event_id, team_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn require_team(conn: &Connection, event_id: &str, team_id: &str) -> Result<TeamRecord, SyncError> {
    load_team(conn, event_id, team_id)?.ok_or_else(|| SyncError::TeamNotFound {
        event_id: event_id.to_string(),
        team_id: team_id.to_string(),
    })
}

/// Overwrite a team document read earlier in the same transaction.
/// Returns the change to publish once the transaction commits.
pub fn write_team(conn: &Connection, event_id: &str, team: &TeamRecord) -> Result<TeamChange, SyncError> {
    let activities_json = serde_json::to_string(&team.activities)?;
    let updated = conn.execute(
        "UPDATE teams
         SET points = ?1, activities_json = ?2, version = version + 1, updated_at = datetime('now')
         WHERE event_id = ?3 AND team_id = ?4",
        params![team.points, activities_json, event_id, team.id],
    )?;
    if updated == 0 {
        return Err(SyncError::TeamNotFound {
            event_id: event_id.to_string(),
            team_id: team.id.clone(),
        });
    }

    let version = team_version(conn, event_id, &team.id)?.unwrap_or_default();
    Ok(TeamChange {
        event_id: event_id.to_string(),
        record: team.clone(),
        version,
    })
}

/// Merge `fields` into an entry, then drop `fields_to_delete`.
///
/// The entry id cannot be changed through a merge.
pub fn merge_fields(
    entry: &TeamActivityRecord,
    fields: &Map<String, Value>,
    fields_to_delete: &[String],
) -> Result<TeamActivityRecord, SyncError> {
    let mut value = serde_json::to_value(entry)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| SyncError::Internal("activity entry is not an object".into()))?;

    for (name, field) in fields {
        object.insert(name.clone(), field.clone());
    }
    for name in fields_to_delete {
        object.remove(name);
    }
    object.insert("id".into(), Value::String(entry.id.clone()));

    Ok(serde_json::from_value(value)?)
}

/// Apply a patch computed from the entry's current state.
pub fn update_entry<F>(
    conn: &Connection,
    key: &ActivityKey,
    patch: F,
) -> Result<(TeamRecord, Vec<TeamChange>), SyncError>
where
    F: FnOnce(&TeamActivityRecord) -> Result<EntryPatch, SyncError>,
{
    let mut team = require_team(conn, &key.event_id, &key.team_id)?;
    let entry = team
        .activity_mut(&key.activity_id)
        .ok_or_else(|| SyncError::ActivityNotFound {
            team_id: key.team_id.clone(),
            activity_id: key.activity_id.clone(),
        })?;

    let patch = patch(entry)?;
    *entry = merge_fields(entry, &patch.fields, &patch.fields_to_delete)?;
    team.points += patch.points_delta;

    let change = write_team(conn, &key.event_id, &team)?;
    debug!(key = %key, delta = patch.points_delta, points = team.points, "Activity entry updated");
    Ok((team, vec![change]))
}

/// Generic single-entry update with an optional points delta
pub fn update_activity_field(
    conn: &Connection,
    key: &ActivityKey,
    fields: Map<String, Value>,
    options: UpdateOptions,
) -> Result<(TeamRecord, Vec<TeamChange>), SyncError> {
    update_entry(conn, key, move |_| {
        Ok(EntryPatch {
            fields,
            fields_to_delete: options.fields_to_delete,
            points_delta: options.points_to_add.unwrap_or(0),
        })
    })
}

/// Delta for a completion given what the entry already awarded
fn award_delta(request: &CompletionRequest, prior_awarded: i64) -> i64 {
    match request.points_to_add {
        Some(target) => target - prior_awarded,
        None => compute_award(&request.activity, request.success, prior_awarded),
    }
}

fn completion_fields(
    request: &CompletionRequest,
    entry: &TeamActivityRecord,
    awarded: i64,
) -> Map<String, Value> {
    // A replayed job keeps the original completion time
    let complete_time = entry
        .complete_time
        .filter(|_| entry.complete)
        .unwrap_or(request.completed_at);

    let mut fields = Map::new();
    fields.insert("complete".into(), Value::Bool(true));
    fields.insert("completeTime".into(), Value::from(complete_time));
    fields.insert("data".into(), request.submission());
    fields.insert("valorate".into(), Value::from(request.valorate));
    fields.insert("awardedPoints".into(), Value::from(awarded));
    fields
}

/// Non-exclusive completion on the claimant's own record
pub fn complete_activity(
    conn: &Connection,
    request: &CompletionRequest,
) -> Result<(ArbitrationResult, Vec<TeamChange>), SyncError> {
    let mut delta = 0;
    let (_, changes) = update_entry(conn, &request.key, |entry| {
        delta = award_delta(request, entry.awarded_points);
        Ok(EntryPatch {
            fields: completion_fields(request, entry, entry.awarded_points + delta),
            fields_to_delete: Vec::new(),
            points_delta: delta,
        })
    })?;
    Ok((ArbitrationResult::accepted(delta), changes))
}

/// Exclusive arbitration: read every competitor, decide, write winner and
/// losers together.
///
/// A failed attempt is arbitrated like a successful one. It wins the activity
/// with a zero award and closes it for the other teams.
pub fn complete_exclusive(
    conn: &Connection,
    request: &CompletionRequest,
) -> Result<(ArbitrationResult, Vec<TeamChange>), SyncError> {
    let key = &request.key;
    let roster = load_roster(conn, &key.event_id)?;
    if !roster.iter().any(|id| id == &key.team_id) {
        return Err(SyncError::TeamNotFound {
            event_id: key.event_id.clone(),
            team_id: key.team_id.clone(),
        });
    }

    let mut teams = roster
        .iter()
        .map(|team_id| require_team(conn, &key.event_id, team_id))
        .collect::<Result<Vec<_>, _>>()?;

    let winner = teams.iter().find(|team| {
        team.id != key.team_id
            && team
                .activity(&key.activity_id)
                .is_some_and(TeamActivityRecord::is_live_completion)
    });
    if let Some(winner) = winner {
        info!(key = %key, winner = %winner.id, "Exclusive activity already claimed");
        return Ok((ArbitrationResult::already_completed_by(winner.id.clone()), Vec::new()));
    }

    let mut changes = Vec::new();
    let mut delta = 0;
    for team in teams.iter_mut() {
        if team.id == key.team_id {
            let entry = team.activity_mut(&key.activity_id).ok_or_else(|| {
                SyncError::ActivityNotFound {
                    team_id: key.team_id.clone(),
                    activity_id: key.activity_id.clone(),
                }
            })?;
            delta = award_delta(request, entry.awarded_points);
            let mut fields = completion_fields(request, entry, entry.awarded_points + delta);
            fields.insert("deleted".into(), Value::Bool(false));
            *entry = merge_fields(entry, &fields, &[])?;
            team.points += delta;
        } else {
            match team.activity_mut(&key.activity_id) {
                Some(entry) if !entry.deleted => entry.deleted = true,
                _ => continue,
            }
        }

        changes.push(write_team(conn, &key.event_id, team)?);
    }

    info!(
        key = %key,
        delta,
        losers = changes.len().saturating_sub(1),
        "Exclusive activity awarded"
    );
    Ok((ArbitrationResult::accepted(delta), changes))
}
