//! Listener Registry - live team reads with reconnect and backoff
//!
//! Each subscription runs one task:
//!
//! ```text
//!   ┌──────────┐  watch ok   ┌──────┐  snapshot   ┌───────────┐  changed   ┌───────────┐
//!   │Connecting│────────────►│ Live │────────────►│ reconcile │───────────►│ on_update │
//!   └──────────┘             └──────┘             └───────────┘            └───────────┘
//!        ▲                       │ error / stream end
//!        │   backoff delay       ▼
//!        └──────────────────┌─────────┐  attempts exhausted  ┌────────┐
//!                           │ Backoff │─────────────────────►│ Failed │
//!                           └─────────┘                      └────────┘
//! ```
//!
//! A failed listener stays idle until [`ListenerRegistry::force_reconnect_all`]
//! is called (the engine does so when connectivity is restored). Any
//! successful delivery resets the attempt counter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reconcile::Reconciler;
use crate::backoff::BackoffPolicy;
use crate::error::SyncError;
use crate::model::TeamRecord;
use crate::remote::{SnapshotSource, TeamPath};

/// Callback for reconciled, changed team records
pub type UpdateCallback = Arc<dyn Fn(TeamRecord) + Send + Sync>;

/// Callback for listener errors. Errors never propagate past this.
pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    Connecting,
    Live,
    Backoff,
    Failed,
}

/// Introspection for one subscription
#[derive(Debug, Clone, Serialize)]
pub struct ListenerHealth {
    pub id: u64,
    pub path: String,
    pub status: ListenerStatus,
    /// Consecutive failed attempts since the last delivery
    pub attempts: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type HealthMap = Arc<Mutex<HashMap<u64, ListenerHealth>>>;

/// Owns every live subscription for one client.
pub struct ListenerRegistry {
    source: Arc<dyn SnapshotSource>,
    reconciler: Arc<Reconciler>,
    policy: BackoffPolicy,
    health: HealthMap,
    reconnect_tx: watch::Sender<u64>,
    next_id: AtomicU64,
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    task: JoinHandle<()>,
    health: HealthMap,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        debug!(id = self.id, "Subscription dropped");
    }
}

impl ListenerRegistry {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        reconciler: Arc<Reconciler>,
        policy: BackoffPolicy,
    ) -> Self {
        let (reconnect_tx, _) = watch::channel(0);
        Self {
            source,
            reconciler,
            policy,
            health: Arc::new(Mutex::new(HashMap::new())),
            reconnect_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a live, reconciled read of one team record.
    pub fn subscribe<U, E>(&self, path: TeamPath, on_update: U, on_error: E) -> Subscription
    where
        U: Fn(TeamRecord) + Send + Sync + 'static,
        E: Fn(&SyncError) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ListenerHealth {
                    id,
                    path: path.to_string(),
                    status: ListenerStatus::Connecting,
                    attempts: 0,
                    last_activity: None,
                    last_error: None,
                },
            );

        let listener = Listener {
            id,
            path,
            source: Arc::clone(&self.source),
            reconciler: Arc::clone(&self.reconciler),
            policy: self.policy,
            health: Arc::clone(&self.health),
            reconnect_rx: self.reconnect_tx.subscribe(),
            on_update: Arc::new(on_update),
            on_error: Arc::new(on_error),
        };
        info!(id, path = %listener.path, "Subscribing");
        let task = tokio::spawn(listener.run());

        Subscription {
            id,
            task,
            health: Arc::clone(&self.health),
        }
    }

    /// Health of every active subscription, ordered by id
    pub fn list_health(&self) -> Vec<ListenerHealth> {
        let mut health: Vec<ListenerHealth> = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        health.sort_by_key(|h| h.id);
        health
    }

    /// Drop every current stream and reconnect immediately, including
    /// listeners that had given up.
    pub fn force_reconnect_all(&self) {
        self.reconnect_tx.send_modify(|generation| *generation += 1);
        info!(listeners = self.len(), "Forcing reconnect of all listeners");
    }

    pub fn len(&self) -> usize {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a stream stopped delivering
enum StreamEnd {
    Failed(SyncError),
    ForcedReconnect,
    Shutdown,
}

struct Listener {
    id: u64,
    path: TeamPath,
    source: Arc<dyn SnapshotSource>,
    reconciler: Arc<Reconciler>,
    policy: BackoffPolicy,
    health: HealthMap,
    reconnect_rx: watch::Receiver<u64>,
    on_update: UpdateCallback,
    on_error: ErrorCallback,
}

impl Listener {
    async fn run(mut self) {
        let mut attempts: u32 = 0;
        let mut accepted: Option<TeamRecord> = None;

        loop {
            self.set_status(ListenerStatus::Connecting, attempts, None);

            let end = match self.source.watch(&self.path).await {
                Ok(stream) => self.consume(stream, &mut attempts, &mut accepted).await,
                Err(e) => StreamEnd::Failed(e),
            };

            let error = match end {
                StreamEnd::Shutdown => break,
                StreamEnd::ForcedReconnect => {
                    attempts = 0;
                    continue;
                }
                StreamEnd::Failed(error) => error,
            };

            warn!(id = self.id, path = %self.path, attempts, error = %error, "Listener error");
            (self.on_error)(&error);

            if self.policy.exhausted(attempts) {
                self.set_status(ListenerStatus::Failed, attempts, Some(&error));
                warn!(id = self.id, path = %self.path, "Reconnect attempts exhausted, listener idle");
                if self.reconnect_rx.changed().await.is_err() {
                    break;
                }
                attempts = 0;
                continue;
            }

            let delay = self.policy.delay(attempts);
            attempts += 1;
            self.set_status(ListenerStatus::Backoff, attempts, Some(&error));
            debug!(id = self.id, delay_ms = delay.as_millis() as u64, attempts, "Reconnecting after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.reconnect_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    attempts = 0;
                }
            }
        }

        debug!(id = self.id, "Listener task ended");
    }

    async fn consume(
        &mut self,
        mut stream: crate::remote::SnapshotStream,
        attempts: &mut u32,
        accepted: &mut Option<TeamRecord>,
    ) -> StreamEnd {
        loop {
            let item = tokio::select! {
                item = stream.recv() => item,
                changed = self.reconnect_rx.changed() => {
                    return if changed.is_err() {
                        StreamEnd::Shutdown
                    } else {
                        StreamEnd::ForcedReconnect
                    };
                }
            };

            let inbound = match item {
                Some(Ok(inbound)) => inbound,
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => {
                    return StreamEnd::Failed(SyncError::SubscriptionClosed(self.path.to_string()))
                }
            };

            *attempts = 0;
            let reconciled = self
                .reconciler
                .reconcile(&self.path, accepted.as_ref(), inbound)
                .await;
            self.touch();

            if accepted.as_ref() != Some(&reconciled) {
                (self.on_update)(reconciled.clone());
                *accepted = Some(reconciled);
            }
        }
    }

    fn touch(&self) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = health.get_mut(&self.id) {
            entry.status = ListenerStatus::Live;
            entry.attempts = 0;
            entry.last_activity = Some(Utc::now());
            entry.last_error = None;
        }
    }

    fn set_status(&self, status: ListenerStatus, attempts: u32, error: Option<&SyncError>) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = health.get_mut(&self.id) {
            entry.status = status;
            entry.attempts = attempts;
            if let Some(error) = error {
                entry.last_error = Some(error.to_string());
            }
        }
    }
}
