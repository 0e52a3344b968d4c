//! Aggregation of converted points across a round's judging panel.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use feis_core::error::TabulationError;
use feis_core::types::{CompetitorId, JudgeId, PanelSize, Points};

use crate::points::JudgeAward;
use crate::tiebreak::TieBreak;

/// One competitor's awards across the panel and their aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitorTally {
    pub competitor: CompetitorId,
    /// Every award received, keyed by judge.
    pub awards: BTreeMap<JudgeId, JudgeAward>,
    /// Judges whose award was discarded as the high or low value.
    pub dropped: Vec<JudgeId>,
    pub aggregate: Points,
}

impl CompetitorTally {
    /// Awards that count toward the aggregate.
    pub fn counted(&self) -> impl Iterator<Item = (&JudgeId, &JudgeAward)> {
        self.awards.iter().filter(|(j, _)| !self.dropped.contains(j))
    }
}

/// Awards that count on a 5-judge panel.
const COUNTED_OF_FIVE: usize = 3;

/// Pick the judge holding the extreme award, lowest judge id on ties.
fn extreme<'a>(
    awards: impl Iterator<Item = (&'a JudgeId, &'a JudgeAward)>,
    want: Ordering,
) -> Option<JudgeId> {
    let mut best: Option<(JudgeId, Points)> = None;
    for (judge, award) in awards {
        match best {
            Some((_, p)) if award.points.cmp(&p) != want => {}
            _ => best = Some((*judge, award.points)),
        }
    }
    best.map(|(j, _)| j)
}

/// Aggregate one competitor's awards.
///
/// A 5-judge panel counts at most three awards: all five present discards
/// one highest and one lowest, four present discards the highest only.
/// Any other case sums whatever awards exist.
pub fn aggregate(
    panel: PanelSize,
    competitor: CompetitorId,
    awards: BTreeMap<JudgeId, JudgeAward>,
) -> Result<CompetitorTally, TabulationError> {
    let mut dropped = Vec::new();
    if panel.drops_extremes() && awards.len() > COUNTED_OF_FIVE {
        if let Some(high) = extreme(awards.iter(), Ordering::Greater) {
            dropped.push(high);
        }
    }
    if panel.drops_extremes() && awards.len() == panel.judges() {
        if let Some(low) = extreme(
            awards.iter().filter(|(j, _)| !dropped.contains(j)),
            Ordering::Less,
        ) {
            dropped.push(low);
        }
    }

    let aggregate = Points::sum(
        awards
            .iter()
            .filter(|(j, _)| !dropped.contains(j))
            .map(|(_, a)| a.points),
    )?;

    Ok(CompetitorTally {
        competitor,
        awards,
        dropped,
        aggregate,
    })
}

/// A tally with its final rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedTally {
    /// Standard competition ranking: 1, 2, 2, 4.
    pub rank: u32,
    pub tally: CompetitorTally,
}

/// Rank tallies by aggregate, then `tie_break`; anything still tied shares
/// a rank. Competitor id orders tied rows for display only.
pub fn rank(mut tallies: Vec<CompetitorTally>, tie_break: &dyn TieBreak) -> Vec<RankedTally> {
    tallies.sort_by(|a, b| {
        b.aggregate
            .cmp(&a.aggregate)
            .then_with(|| tie_break.compare(a, b))
            .then(a.competitor.cmp(&b.competitor))
    });

    let mut ranked: Vec<RankedTally> = Vec::with_capacity(tallies.len());
    for (i, tally) in tallies.into_iter().enumerate() {
        let rank = match ranked.last() {
            Some(prev)
                if prev.tally.aggregate == tally.aggregate
                    && tie_break.compare(&prev.tally, &tally) == Ordering::Equal =>
            {
                prev.rank
            }
            _ => (i + 1) as u32,
        };
        ranked.push(RankedTally { rank, tally });
    }
    ranked
}
