//! Queue Drainer - replays pending completion jobs against the shared store
//!
//! A drain pass walks the queue in insertion order. Each job ends the pass in
//! exactly one of these states:
//!
//! | Outcome                    | Queue          | Ledger        | Event            |
//! |----------------------------|----------------|---------------|------------------|
//! | accepted                   | removed        | marked synced | `Synced`         |
//! | lost exclusive race        | removed        | cleared       | `RaceLost`       |
//! | integrity / fatal error    | removed        | kept          | `Dropped`        |
//! | transient error            | retry_count+1  | kept          | `RetryScheduled` |
//! | transient, retries spent   | removed        | kept          | `Dropped`        |
//!
//! Passes are triggered by enqueue, worker start, connectivity restored and a
//! single backoff timer after a pass that left jobs retrying. There is no
//! polling loop.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::local::{CompletionLedger, CompletionQueue};
use crate::model::{ActivityKey, ArbitrationResult, CompletionJob, CompletionRequest};
use crate::remote::CompletionBackend;

/// Published for every job that leaves a drain pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionEvent {
    Synced {
        key: ActivityKey,
        points_awarded: i64,
    },
    /// Another team already holds the exclusive activity
    RaceLost {
        key: ActivityKey,
        winner: String,
    },
    RetryScheduled {
        key: ActivityKey,
        retry_count: u32,
        error: String,
    },
    /// The job was abandoned. The local completion mark still holds.
    Dropped {
        key: ActivityKey,
        retry_count: u32,
        reason: String,
    },
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub race_lost: usize,
    pub retrying: usize,
    pub dropped: usize,
    /// The pass did not run because the client is offline
    pub skipped_offline: bool,
}

pub struct Drainer {
    queue: Arc<CompletionQueue>,
    ledger: Arc<CompletionLedger>,
    backend: Arc<dyn CompletionBackend>,
    connectivity: Connectivity,
    policy: BackoffPolicy,
    events: broadcast::Sender<CompletionEvent>,
    trigger: Notify,
    pass: Mutex<()>,
}

impl Drainer {
    pub fn new(
        queue: Arc<CompletionQueue>,
        ledger: Arc<CompletionLedger>,
        backend: Arc<dyn CompletionBackend>,
        connectivity: Connectivity,
        policy: BackoffPolicy,
        events: broadcast::Sender<CompletionEvent>,
    ) -> Self {
        Self {
            queue,
            ledger,
            backend,
            connectivity,
            policy,
            events,
            trigger: Notify::new(),
            pass: Mutex::new(()),
        }
    }

    /// Ask the worker for a drain pass. Coalesces with a pending request.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run one drain pass now. Concurrent calls are serialized.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.connectivity.is_online() {
            debug!("Offline, drain skipped");
            report.skipped_offline = true;
            return report;
        }

        let _pass = self.pass.lock().await;
        let pending = self.queue.pending().await;
        if pending.is_empty() {
            return report;
        }
        debug!(jobs = pending.len(), "Drain pass started");

        for (seq, job) in pending {
            report.attempted += 1;
            let request = CompletionRequest::from(&job);
            let result = if job.is_exclusive_claim() {
                self.backend.complete_exclusive_activity(&request).await
            } else {
                self.backend.complete_activity(&request).await
            };

            match result {
                Ok(outcome) => self.settle(seq, &job, outcome, &mut report).await,
                Err(e) => self.fail(seq, job, e, &mut report).await,
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            race_lost = report.race_lost,
            retrying = report.retrying,
            dropped = report.dropped,
            "Drain pass completed"
        );
        report
    }

    async fn settle(
        &self,
        seq: u64,
        job: &CompletionJob,
        outcome: ArbitrationResult,
        report: &mut DrainReport,
    ) {
        let key = job.key();
        self.queue.remove(seq).await;

        if outcome.accepted {
            self.ledger.mark_synced(&key).await;
            report.synced += 1;
            let points_awarded = outcome.points_awarded.unwrap_or(0);
            debug!(key = %key, points_awarded, "Completion synced");
            self.publish(CompletionEvent::Synced {
                key,
                points_awarded,
            });
            return;
        }

        // The other team's completion is authoritative; let snapshots show it
        self.ledger.clear(&key).await;
        report.race_lost += 1;
        let winner = outcome.already_completed_by.unwrap_or_default();
        info!(key = %key, winner = %winner, "Exclusive activity already completed by another team");
        self.publish(CompletionEvent::RaceLost { key, winner });
    }

    async fn fail(&self, seq: u64, mut job: CompletionJob, e: SyncError, report: &mut DrainReport) {
        let key = job.key();

        if !e.is_retryable() {
            error!(key = %key, error = %e, kind = ?e.kind(), "Completion cannot be synced, dropping job");
            self.queue.remove(seq).await;
            report.dropped += 1;
            self.publish(CompletionEvent::Dropped {
                key,
                retry_count: job.retry_count,
                reason: e.to_string(),
            });
            return;
        }

        job.retry_count += 1;
        job.last_retry_at = Some(Utc::now());

        if self.policy.exhausted(job.retry_count) {
            warn!(
                key = %key,
                retry_count = job.retry_count,
                error = %e,
                "Retries exhausted, dropping job; local completion still holds"
            );
            self.queue.remove(seq).await;
            report.dropped += 1;
            self.publish(CompletionEvent::Dropped {
                key,
                retry_count: job.retry_count,
                reason: format!("retries exhausted: {}", e),
            });
            return;
        }

        debug!(key = %key, retry_count = job.retry_count, error = %e, "Completion sync failed, will retry");
        let retry_count = job.retry_count;
        self.queue.update(seq, job).await;
        report.retrying += 1;
        self.publish(CompletionEvent::RetryScheduled {
            key,
            retry_count,
            error: e.to_string(),
        });
    }

    fn publish(&self, event: CompletionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Start the background worker. The first pass runs immediately.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let drainer = Arc::clone(self);
        drainer.trigger();
        tokio::spawn(async move { drainer.run().await })
    }

    async fn run(&self) {
        let mut online_rx = self.connectivity.subscribe();
        let mut retry_deadline: Option<Instant> = None;
        let mut failed_passes: u32 = 0;
        info!("Drain worker started");

        loop {
            let deadline = retry_deadline;
            let retry_timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.trigger.notified() => {}
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online_rx.borrow_and_update() {
                        continue;
                    }
                    info!("Connectivity restored, draining queue");
                }
                _ = retry_timer => {
                    retry_deadline = None;
                }
            }

            let report = self.drain().await;
            if report.retrying > 0 {
                let delay = self.policy.delay(failed_passes);
                failed_passes = failed_passes.saturating_add(1);
                retry_deadline = Some(Instant::now() + delay);
                debug!(delay_ms = delay.as_millis() as u64, "Retry timer armed");
            } else if !report.skipped_offline {
                failed_passes = 0;
                retry_deadline = None;
            }
        }

        info!("Drain worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivitySnapshot, TeamRecord, UpdateOptions};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Backend that replays scripted outcomes, then accepts everything.
    #[derive(Default)]
    struct ScriptedBackend {
        outcomes: std::sync::Mutex<VecDeque<Result<ArbitrationResult, SyncError>>>,
        exclusive_calls: AtomicU32,
        plain_calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn with(outcomes: Vec<Result<ArbitrationResult, SyncError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn next(&self) -> Result<ArbitrationResult, SyncError> {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ArbitrationResult::accepted(10)))
        }

        fn calls(&self) -> u32 {
            self.exclusive_calls.load(Ordering::SeqCst) + self.plain_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete_exclusive_activity(
            &self,
            _request: &CompletionRequest,
        ) -> Result<ArbitrationResult, SyncError> {
            self.exclusive_calls.fetch_add(1, Ordering::SeqCst);
            self.next()
        }

        async fn complete_activity(
            &self,
            _request: &CompletionRequest,
        ) -> Result<ArbitrationResult, SyncError> {
            self.plain_calls.fetch_add(1, Ordering::SeqCst);
            self.next()
        }

        async fn update_activity_field(
            &self,
            key: &ActivityKey,
            _fields: Map<String, Value>,
            _options: UpdateOptions,
        ) -> Result<TeamRecord, SyncError> {
            Ok(TeamRecord::new(key.team_id.clone()))
        }
    }

    struct Harness {
        drainer: Arc<Drainer>,
        queue: Arc<CompletionQueue>,
        ledger: Arc<CompletionLedger>,
        connectivity: Connectivity,
        events: broadcast::Receiver<CompletionEvent>,
    }

    fn harness(backend: Arc<ScriptedBackend>) -> Harness {
        let queue = Arc::new(CompletionQueue::new());
        let ledger = Arc::new(CompletionLedger::new());
        let connectivity = Connectivity::new(true);
        let (events_tx, events) = broadcast::channel(64);
        let drainer = Arc::new(Drainer::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            backend,
            connectivity.clone(),
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 10),
            events_tx,
        ));
        Harness {
            drainer,
            queue,
            ledger,
            connectivity,
            events,
        }
    }

    async fn enqueue(h: &Harness, team: &str, exclusive: bool) -> ActivityKey {
        let key = ActivityKey::new("ev1", team, "5");
        let job = CompletionJob::new(key.clone(), ActivitySnapshot::new("5", 20, exclusive), true);
        h.ledger.mark(&key, job.completed_at).await;
        h.queue.push(job).await;
        key
    }

    #[tokio::test]
    async fn test_accepted_job_is_removed_and_synced() {
        let backend = ScriptedBackend::with(vec![]);
        let mut h = harness(Arc::clone(&backend));
        let key = enqueue(&h, "7", false).await;

        let report = h.drainer.drain().await;
        assert_eq!(report.synced, 1);
        assert!(h.queue.is_empty().await);
        assert!(h.ledger.get(&key).await.unwrap().synced);
        assert_eq!(backend.plain_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.events.recv().await.unwrap(),
            CompletionEvent::Synced {
                key,
                points_awarded: 10
            }
        );
    }

    #[tokio::test]
    async fn test_race_lost_clears_ledger() {
        let backend = ScriptedBackend::with(vec![Ok(ArbitrationResult::already_completed_by("3"))]);
        let mut h = harness(Arc::clone(&backend));
        let key = enqueue(&h, "9", true).await;

        let report = h.drainer.drain().await;
        assert_eq!(report.race_lost, 1);
        assert_eq!(backend.exclusive_calls.load(Ordering::SeqCst), 1);
        assert!(h.queue.is_empty().await);
        assert!(!h.ledger.is_marked(&key).await);
        assert_eq!(
            h.events.recv().await.unwrap(),
            CompletionEvent::RaceLost {
                key,
                winner: "3".into()
            }
        );
    }

    #[tokio::test]
    async fn test_integrity_error_drops_without_retry() {
        let backend = ScriptedBackend::with(vec![Err(SyncError::TeamNotFound {
            event_id: "ev1".into(),
            team_id: "7".into(),
        })]);
        let h = harness(Arc::clone(&backend));
        let key = enqueue(&h, "7", true).await;

        let report = h.drainer.drain().await;
        assert_eq!(report.dropped, 1);
        assert!(h.queue.is_empty().await);
        assert!(h.ledger.is_marked(&key).await);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_after_max_retries() {
        let failures = (0..10)
            .map(|_| Err(SyncError::Unavailable("backend down".into())))
            .collect();
        let backend = ScriptedBackend::with(failures);
        let h = harness(Arc::clone(&backend));
        let key = enqueue(&h, "7", false).await;

        for attempt in 1..10 {
            let report = h.drainer.drain().await;
            assert_eq!(report.retrying, 1);
            let (_, job) = h.queue.pending().await.remove(0);
            assert_eq!(job.retry_count, attempt);
            assert!(job.last_retry_at.is_some());
        }

        let report = h.drainer.drain().await;
        assert_eq!(report.dropped, 1);
        assert!(h.queue.is_empty().await);
        assert!(h.ledger.is_marked(&key).await);
        assert_eq!(backend.calls(), 10);
    }

    #[tokio::test]
    async fn test_offline_skips_pass() {
        let backend = ScriptedBackend::with(vec![]);
        let h = harness(Arc::clone(&backend));
        enqueue(&h, "7", false).await;
        h.connectivity.set_online(false);

        let report = h.drainer.drain().await;
        assert!(report.skipped_offline);
        assert_eq!(h.queue.len().await, 1);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reacts_to_triggers_and_retry_timer() {
        let backend = ScriptedBackend::with(vec![Err(SyncError::Busy("locked".into()))]);
        let h = harness(Arc::clone(&backend));
        h.connectivity.set_online(false);
        enqueue(&h, "7", false).await;

        let worker = h.drainer.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.calls(), 0);

        // Restored connectivity drains; the busy failure arms the retry timer
        h.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(h.queue.len().await, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.calls(), 2);
        assert!(h.queue.is_empty().await);

        enqueue(&h, "8", false).await;
        h.drainer.trigger();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.calls(), 3);

        worker.abort();
    }
}
