//! Relay Ledger - offline-tolerant activity completions for live team events
//!
//! Teams complete activities on flaky mobile connections. A completion must
//! never visibly revert on the device that made it, and an exclusive activity
//! may be won by at most one team.
//!
//! ## Architecture
//!
//! - **Local Completion Ledger**: durable per-client record of completions.
//!   Overrides any inbound snapshot until the shared store echoes it.
//! - **Durable Completion Queue**: write-ahead log of sync jobs, drained on
//!   enqueue, start-up, connectivity restored and a backoff timer.
//! - **Arbitration Transaction**: one serializable read-then-write that picks
//!   the winner of an exclusive activity and marks the losers' copies deleted.
//! - **Subscription Layer**: live team reads with reconnect, backoff, health
//!   and reconciliation against the ledger.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/relay-ledger/
//! ├── local.sled/     # completions + local_completed_activities
//! ├── shared.db       # shared team records (SQLite, WAL)
//! └── config.toml     # Configuration
//! ```

pub mod award;
pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod drain;
pub mod engine;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod subscription;

// Re-exports
pub use backoff::BackoffPolicy;
pub use config::Config;
pub use connectivity::Connectivity;
pub use drain::{CompletionEvent, DrainReport};
pub use engine::{CompletionEngine, EngineConfig};
pub use error::{ErrorKind, SyncError};
pub use local::{CompletionLedger, CompletionQueue, LocalStore, QueueStats};
pub use model::{
    ActivityKey, ActivitySnapshot, ArbitrationResult, CompletionJob, CompletionRequest,
    LocalCompletionMark, TeamActivityRecord, TeamRecord, UpdateOptions,
};
pub use remote::{CompletionBackend, SharedStore, SnapshotSource, TeamPath};
pub use subscription::{ListenerHealth, ListenerRegistry, ListenerStatus, Subscription};
