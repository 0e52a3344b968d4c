//! Recall: which competitors advance after a competition's prior rounds.
//!
//! Cumulative points over every round up to `through_round` are sorted and
//! cut at `ceil(N * percent / 100)`. Everyone tied with the competitor at
//! the cut is recalled as well, so a tie never splits across the line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use feis_core::error::{FeisError, RecallError, TabulationError};
use feis_core::types::{CompetitionId, CompetitorId, Points, RoundId};

use crate::results::RoundResults;

/// One competitor's cumulative standing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RecallEntry {
    pub competitor: CompetitorId,
    pub cumulative_points: Points,
    /// Standard competition ranking by cumulative points.
    pub position: u32,
    pub recalled: bool,
}

/// Recall decision for a competition after a given round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RecallSheet {
    pub competition: CompetitionId,
    /// Sequence number of the last round included.
    pub through_round: u32,
    pub percent: u32,
    /// Ordered by cumulative points descending, then competitor id.
    pub entries: Vec<RecallEntry>,
    pub recalled_count: usize,
    /// `ceil(N * percent / 100)` before extending through ties.
    pub cut_index: usize,
    /// Set when any included round is still provisional.
    pub provisional: bool,
    /// Results revision of each included round.
    pub input_revisions: BTreeMap<RoundId, u64>,
}

impl RecallSheet {
    pub fn recalled(&self) -> impl Iterator<Item = CompetitorId> + '_ {
        self.entries.iter().filter(|e| e.recalled).map(|e| e.competitor)
    }
}

/// `ceil(field * percent / 100)`.
pub fn recall_cut(field: usize, percent: u32) -> usize {
    (field * percent as usize).div_ceil(100)
}

/// Compute the recall sheet.
///
/// `rounds` pairs each round's sequence number with its results; rounds
/// after `through_round` are ignored. Every competitor in `entrants` is
/// part of the field even without points.
pub fn compute_recall(
    competition: CompetitionId,
    through_round: u32,
    rounds: &[(u32, &RoundResults)],
    entrants: &[CompetitorId],
    percent: u32,
) -> Result<RecallSheet, FeisError> {
    if !(1..=100).contains(&percent) {
        return Err(RecallError::InvalidPercent(percent).into());
    }
    let included: Vec<&RoundResults> = rounds
        .iter()
        .filter(|(seq, _)| *seq <= through_round)
        .map(|(_, r)| *r)
        .collect();
    if included.is_empty() {
        return Err(RecallError::NoRounds {
            competition,
            through_round,
        }
        .into());
    }

    let mut totals: BTreeMap<CompetitorId, Points> =
        entrants.iter().map(|c| (*c, Points::ZERO)).collect();
    for results in &included {
        for row in &results.rows {
            let total = totals.entry(row.competitor).or_default();
            *total = total
                .checked_add(row.points)
                .ok_or(TabulationError::PointsOverflow)?;
        }
    }

    let mut standings: Vec<(CompetitorId, Points)> = totals.into_iter().collect();
    standings.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let cut_index = recall_cut(standings.len(), percent);
    let boundary = cut_index
        .checked_sub(1)
        .and_then(|i| standings.get(i))
        .map(|(_, p)| *p);

    let mut entries: Vec<RecallEntry> = Vec::with_capacity(standings.len());
    for (i, (competitor, cumulative_points)) in standings.into_iter().enumerate() {
        let position = match entries.last() {
            Some(prev) if prev.cumulative_points == cumulative_points => prev.position,
            _ => (i + 1) as u32,
        };
        entries.push(RecallEntry {
            competitor,
            cumulative_points,
            position,
            recalled: boundary.is_some_and(|b| cumulative_points >= b),
        });
    }
    let recalled_count = entries.iter().filter(|e| e.recalled).count();
    debug!(
        %competition,
        through_round,
        field = entries.len(),
        cut_index,
        recalled_count,
        "recall computed"
    );

    Ok(RecallSheet {
        competition,
        through_round,
        percent,
        entries,
        recalled_count,
        cut_index,
        provisional: included.iter().any(|r| r.provisional()),
        input_revisions: included.iter().map(|r| (r.round, r.revision)).collect(),
    })
}
