//! Error types for relay-ledger

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Team not found: {team_id} in event {event_id}")]
    TeamNotFound { event_id: String, team_id: String },

    #[error("Activity not found: {activity_id} for team {team_id}")]
    ActivityNotFound { team_id: String, activity_id: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Shared store busy: {0}")]
    Busy(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Local store error: {0}")]
    LocalStore(#[from] sled::Error),

    #[error("Shared store error: {0}")]
    SharedStore(rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a failure should be treated by the queue and the listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, contention, temporary unavailability. Retried with backoff.
    Transient,
    /// A referenced event, team or activity does not exist. Never retried.
    Integrity,
    /// The local store could not persist. Work continues in memory.
    Durability,
    /// Anything else that retrying cannot fix.
    Fatal,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Unavailable(_)
            | SyncError::Busy(_)
            | SyncError::Timeout(_)
            | SyncError::SubscriptionClosed(_)
            | SyncError::SharedStore(_) => ErrorKind::Transient,
            SyncError::EventNotFound(_)
            | SyncError::TeamNotFound { .. }
            | SyncError::ActivityNotFound { .. } => ErrorKind::Integrity,
            SyncError::Io(_) | SyncError::LocalStore(_) => ErrorKind::Durability,
            SyncError::InvalidPath(_)
            | SyncError::Serialization(_)
            | SyncError::Json(_)
            | SyncError::Config(_)
            | SyncError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a queued job that hit this error should stay in the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Durability)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                SyncError::Busy(e.to_string())
            }
            _ => SyncError::SharedStore(e),
        }
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(SyncError::Busy("locked".into()).kind(), ErrorKind::Transient);
        assert!(SyncError::Timeout("slow".into()).is_retryable());

        let missing = SyncError::TeamNotFound {
            event_id: "e1".into(),
            team_id: "t9".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::Integrity);
        assert!(!missing.is_retryable());

        assert!(!SyncError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn test_busy_sqlite_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let mapped = SyncError::from(err);
        assert!(matches!(mapped, SyncError::Busy(_)));
        assert!(mapped.is_retryable());
    }
}
