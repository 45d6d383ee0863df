//! Completion Engine - the client-facing entry points
//!
//! Wires the local store, the drain worker and the listener registry to one
//! shared backend:
//!
//! ```text
//!   enqueue_completion ─► ledger.mark ─► queue.push ─► Drainer ─► CompletionBackend
//!                                                          │
//!                                        CompletionEvent ◄─┘
//!
//!   subscribe ─► ListenerRegistry ─► SnapshotSource ─► Reconciler(ledger) ─► on_update
//! ```
//!
//! Connectivity restored triggers a drain and reconnects every listener.

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::drain::{CompletionEvent, DrainReport, Drainer};
use crate::error::SyncError;
use crate::local::{CompletionLedger, CompletionQueue, LocalStore, QueueStats};
use crate::model::{
    ActivityKey, ArbitrationResult, CompletionJob, CompletionRequest, LocalCompletionMark,
    TeamRecord, UpdateOptions,
};
use crate::remote::{CompletionBackend, SnapshotSource, TeamPath};
use crate::subscription::{ListenerHealth, ListenerRegistry, Reconciler, Subscription};

/// Runtime knobs for the engine
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub queue_backoff: BackoffPolicy,
    pub listener_backoff: BackoffPolicy,
    /// Capacity of the completion event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_backoff: BackoffPolicy::queue_default(),
            listener_backoff: BackoffPolicy::listener_default(),
            event_capacity: 256,
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue_backoff: config.queue_backoff(),
            listener_backoff: config.listener_backoff(),
            event_capacity: config.event_capacity,
        }
    }
}

pub struct CompletionEngine {
    ledger: Arc<CompletionLedger>,
    queue: Arc<CompletionQueue>,
    backend: Arc<dyn CompletionBackend>,
    drainer: Arc<Drainer>,
    registry: Arc<ListenerRegistry>,
    connectivity: Connectivity,
    events: broadcast::Sender<CompletionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CompletionEngine {
    /// Build an engine over the local store's partitions. Call
    /// [`start`](Self::start) to begin draining.
    pub fn new(
        local: &LocalStore,
        backend: Arc<dyn CompletionBackend>,
        source: Arc<dyn SnapshotSource>,
        connectivity: Connectivity,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(local.ledger());
        let queue = Arc::new(local.queue());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let drainer = Arc::new(Drainer::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            Arc::clone(&backend),
            connectivity.clone(),
            config.queue_backoff,
            events.clone(),
        ));
        let registry = Arc::new(ListenerRegistry::new(
            source,
            Arc::new(Reconciler::new(Arc::clone(&ledger))),
            config.listener_backoff,
        ));

        if !local.is_durable() {
            warn!("Completion engine running without durable local storage");
        }

        Self {
            ledger,
            queue,
            backend,
            drainer,
            registry,
            connectivity,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the drain worker and the reconnect-on-restore watcher.
    /// Jobs left by a previous run are drained right away.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("Completion engine already started");
            return;
        }

        tasks.push(self.drainer.spawn());

        let registry = Arc::clone(&self.registry);
        let mut online_rx = self.connectivity.subscribe();
        tasks.push(tokio::spawn(async move {
            while online_rx.changed().await.is_ok() {
                if *online_rx.borrow_and_update() {
                    registry.force_reconnect_all();
                }
            }
        }));

        info!("Completion engine started");
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Completion engine stopped");
    }

    // =========================================================================
    // Completions
    // =========================================================================

    /// Record a completion locally and queue it for sync.
    ///
    /// The returned mark protects the completion in every reconciled snapshot
    /// from now on, whether or not the client is online.
    pub async fn enqueue_completion(&self, job: CompletionJob) -> LocalCompletionMark {
        let key = job.key();
        let mark = self.ledger.mark(&key, job.completed_at).await;
        let seq = self.queue.push(job).await;
        info!(key = %key, seq, "Completion enqueued");
        self.drainer.trigger();
        mark
    }

    /// Run the exclusive arbitration directly, bypassing the queue
    pub async fn complete_exclusive_activity(
        &self,
        request: &CompletionRequest,
    ) -> Result<ArbitrationResult, SyncError> {
        self.backend.complete_exclusive_activity(request).await
    }

    pub async fn update_activity_field(
        &self,
        key: &ActivityKey,
        fields: Map<String, Value>,
        options: UpdateOptions,
    ) -> Result<TeamRecord, SyncError> {
        self.backend.update_activity_field(key, fields, options).await
    }

    /// Drain the queue now instead of waiting for a trigger
    pub async fn drain(&self) -> DrainReport {
        self.drainer.drain().await
    }

    pub fn events(&self) -> broadcast::Receiver<CompletionEvent> {
        self.events.subscribe()
    }

    pub async fn list_pending(&self) -> Vec<CompletionJob> {
        self.queue
            .pending()
            .await
            .into_iter()
            .map(|(_, job)| job)
            .collect()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Forget every pending job and local completion mark.
    ///
    /// Returns (jobs removed, marks removed).
    pub async fn clear_cache(&self) -> (usize, usize) {
        let jobs = self.queue.clear_all().await;
        let marks = self.ledger.clear_all().await;
        warn!(jobs, marks, "Local completion cache cleared");
        (jobs, marks)
    }

    pub fn ledger(&self) -> &Arc<CompletionLedger> {
        &self.ledger
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    // =========================================================================
    // Live reads
    // =========================================================================

    pub fn subscribe<U, E>(&self, path: TeamPath, on_update: U, on_error: E) -> Subscription
    where
        U: Fn(TeamRecord) + Send + Sync + 'static,
        E: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.registry.subscribe(path, on_update, on_error)
    }

    pub fn list_health(&self) -> Vec<ListenerHealth> {
        self.registry.list_health()
    }

    pub fn force_reconnect_all(&self) {
        self.registry.force_reconnect_all();
    }
}

impl Drop for CompletionEngine {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
