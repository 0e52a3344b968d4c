//! Secondary ordering for competitors with equal aggregate points.
//!
//! The governing rule for breaking aggregate ties is not fixed, so the rule
//! is a named policy chosen by configuration. Competitors the policy still
//! cannot separate share a rank.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use feis_core::error::TabulationError;

use crate::panel::CompetitorTally;

/// Orders two competitors whose aggregates are equal.
///
/// `Ordering::Less` places `a` ahead of `b`; `Equal` leaves them tied.
pub trait TieBreak: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, a: &CompetitorTally, b: &CompetitorTally) -> Ordering;
}

/// Built-in tie-break policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    /// Leave equal aggregates tied.
    #[default]
    SharedRank,
    /// Higher sum of raw marks across every judge wins.
    RawMarkTotal,
    /// Lower sum of placements across the counted judges wins.
    PlacementSum,
}

impl TieBreakPolicy {
    pub const ALL: [TieBreakPolicy; 3] = [Self::SharedRank, Self::RawMarkTotal, Self::PlacementSum];
}

fn raw_total(t: &CompetitorTally) -> OrderedFloat<f64> {
    OrderedFloat(t.awards.values().map(|a| a.mark.value()).sum())
}

fn placement_sum(t: &CompetitorTally) -> u64 {
    t.counted().map(|(_, a)| u64::from(a.placement)).sum()
}

impl TieBreak for TieBreakPolicy {
    fn name(&self) -> &'static str {
        match self {
            Self::SharedRank => "shared_rank",
            Self::RawMarkTotal => "raw_mark_total",
            Self::PlacementSum => "placement_sum",
        }
    }

    fn compare(&self, a: &CompetitorTally, b: &CompetitorTally) -> Ordering {
        match self {
            Self::SharedRank => Ordering::Equal,
            Self::RawMarkTotal => raw_total(b).cmp(&raw_total(a)),
            Self::PlacementSum => placement_sum(a).cmp(&placement_sum(b)),
        }
    }
}

impl fmt::Display for TieBreakPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TieBreakPolicy {
    type Err = TabulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| TabulationError::UnknownTieBreak(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::aggregate;
    use crate::points::JudgeAward;
    use feis_core::types::{CompetitorId, JudgeId, Mark, PanelSize, Points};
    use std::collections::BTreeMap;

    fn tally(competitor: u64, awards: &[(u64, u32, u64, f64)]) -> CompetitorTally {
        let awards: BTreeMap<JudgeId, JudgeAward> = awards
            .iter()
            .map(|&(judge, placement, points, mark)| {
                (
                    JudgeId(judge),
                    JudgeAward {
                        placement,
                        points: Points::from_whole(points),
                        mark: Mark::new(mark).unwrap(),
                    },
                )
            })
            .collect();
        aggregate(PanelSize::Three, CompetitorId(competitor), awards).unwrap()
    }

    #[test]
    fn policies_parse_by_name() {
        for policy in TieBreakPolicy::ALL {
            assert_eq!(policy.to_string().parse::<TieBreakPolicy>(), Ok(policy));
        }
        assert!(matches!(
            "coin_toss".parse::<TieBreakPolicy>(),
            Err(TabulationError::UnknownTieBreak(_))
        ));
        assert!(serde_json::from_str::<TieBreakPolicy>("\"coin_toss\"").is_err());
    }

    #[test]
    fn shared_rank_never_separates() {
        let a = tally(1, &[(1, 1, 100, 90.0), (2, 2, 75, 80.0), (3, 3, 65, 70.0)]);
        let b = tally(2, &[(1, 3, 65, 70.0), (2, 2, 75, 80.0), (3, 1, 100, 90.0)]);
        assert_eq!(TieBreakPolicy::SharedRank.compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn raw_mark_total_prefers_higher_marks() {
        let a = tally(1, &[(1, 1, 100, 95.0), (2, 2, 75, 80.0), (3, 3, 65, 70.0)]);
        let b = tally(2, &[(1, 2, 75, 90.0), (2, 1, 100, 82.0), (3, 3, 65, 70.0)]);
        assert_eq!(TieBreakPolicy::RawMarkTotal.compare(&a, &b), Ordering::Less);
        assert_eq!(TieBreakPolicy::RawMarkTotal.compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn placement_sum_prefers_lower() {
        let a = tally(1, &[(1, 1, 100, 90.0), (2, 2, 75, 80.0), (3, 2, 65, 70.0)]);
        let b = tally(2, &[(1, 2, 100, 90.0), (2, 2, 75, 80.0), (3, 3, 65, 70.0)]);
        assert_eq!(TieBreakPolicy::PlacementSum.compare(&a, &b), Ordering::Less);
    }
}
