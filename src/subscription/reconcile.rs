//! Reconciler - applies local completion truth to inbound team snapshots
//!
//! Completion is a one-way ratchet. A push from the shared store may reflect
//! a read taken before a very recent local or transactional change, so a
//! snapshot is never allowed to un-complete an activity:
//!
//! 1. A ledger mark forces `complete = true`. Once the inbound snapshot itself
//!    reports the completion, the mark is cleared.
//! 2. If the previously accepted state had the activity complete and the
//!    snapshot does not, the prior entry is kept. The inbound `deleted` flag
//!    is still honoured so a lost exclusive race disappears from view.

use std::sync::Arc;
use tracing::debug;

use crate::local::CompletionLedger;
use crate::model::{TeamActivityRecord, TeamRecord};
use crate::remote::TeamPath;

pub struct Reconciler {
    ledger: Arc<CompletionLedger>,
}

impl Reconciler {
    pub fn new(ledger: Arc<CompletionLedger>) -> Self {
        Self { ledger }
    }

    /// Produce the application-visible record for an inbound snapshot.
    pub async fn reconcile(
        &self,
        path: &TeamPath,
        prior: Option<&TeamRecord>,
        mut inbound: TeamRecord,
    ) -> TeamRecord {
        for mark in self.ledger.list_for_team(&path.event_id, &path.team_id).await {
            let activity_id = &mark.key.activity_id;
            match inbound.activity_mut(activity_id) {
                Some(entry) if entry.complete => {
                    self.ledger.clear(&mark.key).await;
                    debug!(key = %mark.key, "Remote echoed completion, ledger mark cleared");
                }
                Some(entry) => {
                    entry.complete = true;
                    entry.complete_time = Some(mark.completed_at);
                    debug!(key = %mark.key, "Stale snapshot overridden by ledger");
                }
                None => {
                    let mut entry = prior
                        .and_then(|p| p.activity(activity_id))
                        .cloned()
                        .unwrap_or_else(|| TeamActivityRecord::new(activity_id.clone(), false));
                    entry.complete = true;
                    entry.complete_time = entry.complete_time.or(Some(mark.completed_at));
                    inbound.activities.push(entry);
                }
            }
        }

        let Some(prior) = prior else {
            return inbound;
        };

        for previous in prior.activities.iter().filter(|a| a.complete) {
            match inbound.activity_mut(&previous.id) {
                Some(entry) if entry.complete => {}
                Some(entry) => {
                    let deleted = entry.deleted;
                    *entry = previous.clone();
                    entry.deleted = deleted;
                    debug!(team = %path.team_id, activity = %previous.id, "Rejected completion regression");
                }
                None => {
                    inbound.activities.push(previous.clone());
                    debug!(team = %path.team_id, activity = %previous.id, "Kept completed activity missing from snapshot");
                }
            }
        }

        inbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityKey;

    fn team_with(activity: TeamActivityRecord) -> TeamRecord {
        let mut team = TeamRecord::new("7");
        team.activities.push(activity);
        team
    }

    fn completed(id: &str, at: i64) -> TeamActivityRecord {
        let mut entry = TeamActivityRecord::new(id, false);
        entry.complete = true;
        entry.complete_time = Some(at);
        entry.awarded_points = 10;
        entry
    }

    #[tokio::test]
    async fn test_stale_snapshot_keeps_ledger_completion() {
        let ledger = Arc::new(CompletionLedger::new());
        let key = ActivityKey::new("ev1", "7", "42");
        ledger.mark(&key, 1_700_000_000).await;
        let reconciler = Reconciler::new(Arc::clone(&ledger));
        let path = TeamPath::new("ev1", "7");

        let stale = team_with(TeamActivityRecord::new("42", false));
        let visible = reconciler.reconcile(&path, None, stale).await;

        let entry = visible.activity("42").unwrap();
        assert!(entry.complete);
        assert_eq!(entry.complete_time, Some(1_700_000_000));
        assert!(ledger.is_marked(&key).await);
    }

    #[tokio::test]
    async fn test_echo_clears_mark() {
        let ledger = Arc::new(CompletionLedger::new());
        let key = ActivityKey::new("ev1", "7", "42");
        ledger.mark(&key, 1).await;
        let reconciler = Reconciler::new(Arc::clone(&ledger));

        let echoed = team_with(completed("42", 5));
        let visible = reconciler
            .reconcile(&TeamPath::new("ev1", "7"), None, echoed.clone())
            .await;
        assert_eq!(visible, echoed);
        assert!(!ledger.is_marked(&key).await);
    }

    #[tokio::test]
    async fn test_regression_against_prior_is_rejected() {
        let reconciler = Reconciler::new(Arc::new(CompletionLedger::new()));
        let path = TeamPath::new("ev1", "7");
        let prior = team_with(completed("42", 5));

        let regressed = team_with(TeamActivityRecord::new("42", false));
        let visible = reconciler.reconcile(&path, Some(&prior), regressed).await;
        assert_eq!(visible.activity("42"), prior.activity("42"));

        let vanished = TeamRecord::new("7");
        let visible = reconciler.reconcile(&path, Some(&prior), vanished).await;
        assert!(visible.activity("42").unwrap().complete);
    }

    #[tokio::test]
    async fn test_deletion_still_applies() {
        let reconciler = Reconciler::new(Arc::new(CompletionLedger::new()));
        let prior = team_with(completed("5", 5));

        let mut lost = TeamActivityRecord::new("5", true);
        lost.deleted = true;
        let visible = reconciler
            .reconcile(&TeamPath::new("ev1", "7"), Some(&prior), team_with(lost))
            .await;

        let entry = visible.activity("5").unwrap();
        assert!(entry.complete);
        assert!(entry.deleted);
    }

    #[tokio::test]
    async fn test_marks_for_other_teams_ignored() {
        let ledger = Arc::new(CompletionLedger::new());
        ledger.mark(&ActivityKey::new("ev1", "8", "42"), 1).await;
        let reconciler = Reconciler::new(ledger);

        let inbound = team_with(TeamActivityRecord::new("42", false));
        let visible = reconciler
            .reconcile(&TeamPath::new("ev1", "7"), None, inbound.clone())
            .await;
        assert_eq!(visible, inbound);
    }
}
