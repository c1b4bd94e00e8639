//! Last-Writer-Wins merge at record granularity.
//!
//! The remote side prevails only when its `updated_at` is strictly greater
//! than the local record's; ties go to local so repeated hydration is
//! idempotent. Tombstones follow the same rule and hide the local record
//! when applied.

use inkstone_domain::Record;

/// Outcome of comparing a remote row against the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// The remote version is newer; write it to the local store.
    ApplyRemote,
    /// The local version is as new or newer; leave it untouched.
    KeepLocal,
}

/// Decide whether a remote version at `remote_updated_at` replaces the
/// local record.
pub fn decide(local: Option<&Record>, remote_updated_at: i64) -> MergeDecision {
    match local {
        Some(record) if record.updated_at >= remote_updated_at => MergeDecision::KeepLocal,
        _ => MergeDecision::ApplyRemote,
    }
}

/// Convenience wrapper: true when the remote version should be applied.
pub fn remote_wins(local: Option<&Record>, remote_updated_at: i64) -> bool {
    decide(local, remote_updated_at) == MergeDecision::ApplyRemote
}

#[cfg(test)]
mod tests {
    //! Unit tests for LWW merge decisions.
    use inkstone_domain::RecordTable;
    use serde_json::json;

    use super::*;

    fn record(updated_at: i64, deleted_at: Option<i64>) -> Record {
        Record {
            id: "c1".into(),
            table: RecordTable::Chapters,
            project_id: Some("p1".into()),
            updated_at,
            deleted_at,
            payload: json!({"title": "One"}),
            client_rev: None,
            client_hash: None,
        }
    }

    #[test]
    fn missing_local_applies_remote() {
        assert_eq!(decide(None, 100), MergeDecision::ApplyRemote);
    }

    #[test]
    fn newer_remote_wins() {
        let local = record(50, None);
        assert_eq!(decide(Some(&local), 100), MergeDecision::ApplyRemote);
    }

    #[test]
    fn older_remote_loses() {
        let local = record(200, None);
        assert_eq!(decide(Some(&local), 100), MergeDecision::KeepLocal);
    }

    /// Ties go to local, keeping hydration idempotent.
    #[test]
    fn ties_keep_local() {
        let local = record(100, None);
        assert_eq!(decide(Some(&local), 100), MergeDecision::KeepLocal);
    }

    /// Tombstones follow the same rule: a newer remote still replaces a
    /// local tombstone, and an old remote cannot resurrect one.
    #[test]
    fn tombstones_follow_same_rule() {
        let tombstone = record(150, Some(150));
        assert_eq!(decide(Some(&tombstone), 100), MergeDecision::KeepLocal);
        assert_eq!(decide(Some(&tombstone), 200), MergeDecision::ApplyRemote);
    }

    /// Applying (A then B) and (B then A) converges when the timestamps
    /// differ: the greater timestamp ends up stored either way.
    #[test]
    fn merge_is_commutative_per_record() {
        let a = record(100, None);
        let b = record(200, None);

        // Order A, B: A applied onto empty, then B wins over A.
        let first = remote_wins(None, a.updated_at);
        assert!(first);
        let second = remote_wins(Some(&a), b.updated_at);
        assert!(second, "B replaces A");

        // Order B, A: B applied onto empty, then A loses to B.
        let first = remote_wins(None, b.updated_at);
        assert!(first);
        let second = remote_wins(Some(&b), a.updated_at);
        assert!(!second, "A does not replace B");
    }
}
