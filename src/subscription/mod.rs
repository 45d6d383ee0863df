//! Live team reads
//!
//! - `reconcile`: merges inbound snapshots with local completion truth
//! - `registry`: per-subscription tasks with reconnect, backoff and health

pub mod reconcile;
pub mod registry;

pub use reconcile::Reconciler;
pub use registry::{ListenerHealth, ListenerRegistry, ListenerStatus, Subscription};
