//! Point awards for completed activities.
//!
//! Every completion path (queued, direct, exclusive) derives its points delta
//! from here so a replayed job adds nothing the second time.

use crate::model::ActivitySnapshot;

/// Points an entry should carry once this result is recorded.
pub fn award_target(activity: &ActivitySnapshot, success: bool) -> i64 {
    if success {
        activity.points
    } else {
        0
    }
}

/// Delta to add to the team total, given what the entry already awarded.
pub fn compute_award(activity: &ActivitySnapshot, success: bool, prior_awarded_points: i64) -> i64 {
    award_target(activity, success) - prior_awarded_points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_award() {
        let activity = ActivitySnapshot::new("42", 10, false);
        assert_eq!(compute_award(&activity, true, 0), 10);
        assert_eq!(compute_award(&activity, false, 0), 0);
    }

    #[test]
    fn test_replay_awards_nothing() {
        let activity = ActivitySnapshot::new("42", 10, false);
        assert_eq!(compute_award(&activity, true, 10), 0);
    }

    #[test]
    fn test_downgrade_reverses_award() {
        let activity = ActivitySnapshot::new("42", 10, false);
        assert_eq!(compute_award(&activity, false, 10), -10);
    }
}
