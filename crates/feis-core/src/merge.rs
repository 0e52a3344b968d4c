//! Reconciliation rules for merging a device's offline scores into the
//! authoritative ledger.
//!
//! Both ledger implementations call [`decide`] so an in-memory ledger and a
//! RocksDB ledger merge identically. The rules, in order:
//!
//! 1. Empty cell: the incoming value is applied.
//! 2. Same mark already stored: unchanged (replays are harmless).
//! 3. Same origin: the higher per-origin sequence wins. Equal sequences with
//!    different marks cannot be ordered and conflict. When either write is
//!    unsequenced the later submission replaces the earlier one, ordered by
//!    timestamp.
//! 4. Different origins: the later timestamp wins when the two timestamps
//!    are further apart than the conflict window; otherwise the ordering is
//!    ambiguous and the cell keeps its value pending review.

use crate::types::{MergePolicy, Score, SyncConflict, TimestampMs};

/// What a ledger should do with an incoming reconciled score.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeDecision {
    Apply,
    Unchanged,
    Stale,
    Conflict,
}

/// Decide how `incoming` merges against the cell's current value.
pub fn decide(existing: Option<&Score>, incoming: &Score, policy: &MergePolicy) -> MergeDecision {
    let Some(current) = existing else {
        return MergeDecision::Apply;
    };

    if current.mark == incoming.mark {
        return MergeDecision::Unchanged;
    }

    if current.origin == incoming.origin {
        if !current.is_sequenced() || !incoming.is_sequenced() {
            return if incoming.timestamp_ms >= current.timestamp_ms {
                MergeDecision::Apply
            } else {
                MergeDecision::Stale
            };
        }
        return match incoming.sequence.cmp(&current.sequence) {
            std::cmp::Ordering::Greater => MergeDecision::Apply,
            std::cmp::Ordering::Less => MergeDecision::Stale,
            std::cmp::Ordering::Equal => MergeDecision::Conflict,
        };
    }

    let gap = incoming.timestamp_ms.abs_diff(current.timestamp_ms);
    if gap <= policy.conflict_window_ms {
        MergeDecision::Conflict
    } else if incoming.timestamp_ms > current.timestamp_ms {
        MergeDecision::Apply
    } else {
        MergeDecision::Stale
    }
}

/// Build the conflict record for an ambiguous merge.
pub fn conflict(current: &Score, incoming: &Score, detected_at_ms: TimestampMs) -> SyncConflict {
    SyncConflict {
        key: incoming.key,
        authoritative: current.clone(),
        contender: incoming.clone(),
        detected_at_ms,
    }
}

/// Whether `conflicts` already holds this contender. Replayed batches must
/// not pile up duplicate review items.
pub fn already_recorded(conflicts: &[SyncConflict], contender: &Score) -> bool {
    conflicts.iter().any(|c| c.contender.same_write(contender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompetitorId, JudgeId, Mark, OriginId, RoundId, ScoreKey};

    fn score(mark: f64, origin: &str, ts: u64, seq: u64) -> Score {
        Score {
            key: ScoreKey::new(RoundId(1), CompetitorId(10), JudgeId(2)),
            mark: Mark::new(mark).unwrap(),
            timestamp_ms: ts,
            origin: OriginId::new(origin),
            sequence: seq,
        }
    }

    fn policy() -> MergePolicy {
        MergePolicy {
            conflict_window_ms: 1_000,
        }
    }

    #[test]
    fn empty_cell_applies() {
        assert_eq!(
            decide(None, &score(80.0, "a", 10, 1), &policy()),
            MergeDecision::Apply
        );
    }

    #[test]
    fn same_mark_is_unchanged() {
        let cur = score(80.0, "a", 10, 1);
        let inc = score(80.0, "b", 50_000, 9);
        assert_eq!(decide(Some(&cur), &inc, &policy()), MergeDecision::Unchanged);
    }

    #[test]
    fn same_origin_orders_by_sequence() {
        let cur = score(80.0, "a", 50_000, 5);
        // Clock went backwards but the sequence moved forward.
        let newer = score(82.0, "a", 10, 6);
        let older = score(78.0, "a", 90_000, 4);
        assert_eq!(decide(Some(&cur), &newer, &policy()), MergeDecision::Apply);
        assert_eq!(decide(Some(&cur), &older, &policy()), MergeDecision::Stale);
    }

    #[test]
    fn same_origin_same_sequence_conflicts() {
        let cur = score(80.0, "a", 10, 5);
        let inc = score(81.0, "a", 10, 5);
        assert_eq!(decide(Some(&cur), &inc, &policy()), MergeDecision::Conflict);
    }

    #[test]
    fn same_origin_unsequenced_later_write_replaces() {
        let cur = score(80.0, "judge:1", 1_000, 0);
        let later = score(82.0, "judge:1", 600_000, 0);
        let same_instant = score(83.0, "judge:1", 1_000, 0);
        let earlier = score(78.0, "judge:1", 500, 0);
        assert_eq!(decide(Some(&cur), &later, &policy()), MergeDecision::Apply);
        assert_eq!(decide(Some(&cur), &same_instant, &policy()), MergeDecision::Apply);
        assert_eq!(decide(Some(&cur), &earlier, &policy()), MergeDecision::Stale);
    }

    #[test]
    fn different_origin_resolved_outside_window() {
        let cur = score(80.0, "a", 10_000, 1);
        let later = score(85.0, "b", 11_001, 1);
        let earlier = score(85.0, "b", 8_999, 1);
        assert_eq!(decide(Some(&cur), &later, &policy()), MergeDecision::Apply);
        assert_eq!(decide(Some(&cur), &earlier, &policy()), MergeDecision::Stale);
    }

    #[test]
    fn different_origin_within_window_conflicts() {
        let cur = score(80.0, "a", 10_000, 1);
        let close_after = score(85.0, "b", 11_000, 1);
        let close_before = score(85.0, "b", 9_500, 1);
        assert_eq!(decide(Some(&cur), &close_after, &policy()), MergeDecision::Conflict);
        assert_eq!(decide(Some(&cur), &close_before, &policy()), MergeDecision::Conflict);
    }

    #[test]
    fn replayed_contender_detected() {
        let cur = score(80.0, "a", 10_000, 1);
        let inc = score(85.0, "b", 10_100, 1);
        let recorded = vec![conflict(&cur, &inc, 20_000)];
        assert!(already_recorded(&recorded, &inc));
        assert!(!already_recorded(&recorded, &score(86.0, "b", 10_100, 1)));
    }
}
