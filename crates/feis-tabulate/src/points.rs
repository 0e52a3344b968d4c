//! Conversion of one judge's raw marks into placements and points.
//!
//! Marks are only compared, never scaled: the points a competitor receives
//! from a judge depend solely on where that judge ranked them. Tied marks
//! share the points of the placements they jointly occupy; the split is
//! done in micro-points and rounded half-up.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use feis_core::constants::STANDARD_POINTS;
use feis_core::error::TabulationError;
use feis_core::types::{CompetitorId, Mark, Points};

/// Whole points per placement, 1st first. Placements past the end earn zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct PointsTable {
    points: Vec<Points>,
}

impl PointsTable {
    /// The published conversion table, 100 points for 1st down to 1 for 50th.
    pub fn standard() -> Self {
        Self {
            points: STANDARD_POINTS.iter().map(|&p| Points::from_whole(p)).collect(),
        }
    }

    /// A replacement table. Must be non-empty and never increase.
    pub fn from_whole_points(values: Vec<u64>) -> Result<Self, TabulationError> {
        if values.is_empty() {
            return Err(TabulationError::InvalidPointsTable("empty table".into()));
        }
        if let Some(i) = values.windows(2).position(|w| w[1] > w[0]) {
            return Err(TabulationError::InvalidPointsTable(format!(
                "placement {} awards more than placement {}",
                i + 2,
                i + 1
            )));
        }
        if values.iter().any(|&p| p.checked_mul(feis_core::constants::POINTS_PRECISION).is_none()) {
            return Err(TabulationError::PointsOverflow);
        }
        Ok(Self {
            points: values.into_iter().map(Points::from_whole).collect(),
        })
    }

    /// Points for a 1-based placement.
    pub fn points_for(&self, placement: usize) -> Points {
        placement
            .checked_sub(1)
            .and_then(|i| self.points.get(i))
            .copied()
            .unwrap_or(Points::ZERO)
    }

    /// Number of placements that earn points.
    pub fn scored_placements(&self) -> usize {
        self.points.len()
    }
}

impl Default for PointsTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TryFrom<Vec<u64>> for PointsTable {
    type Error = TabulationError;

    fn try_from(values: Vec<u64>) -> Result<Self, Self::Error> {
        Self::from_whole_points(values)
    }
}

impl From<PointsTable> for Vec<u64> {
    fn from(table: PointsTable) -> Self {
        table
            .points
            .iter()
            .map(|p| p.micros() / feis_core::constants::POINTS_PRECISION)
            .collect()
    }
}

/// What one judge awarded one competitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeAward {
    /// 1-based placement; tied competitors share the block's first placement.
    pub placement: u32,
    pub points: Points,
    pub mark: Mark,
}

/// Evenly split `total` micro-points across `ways`, rounding half-up.
fn split(total: u128, ways: u128) -> Result<Points, TabulationError> {
    let share = (total * 2 + ways) / (ways * 2);
    u64::try_from(share)
        .map(Points::from_micros)
        .map_err(|_| TabulationError::PointsOverflow)
}

/// Convert one judge's marks for one round.
///
/// `marks` holds at most one entry per competitor, already restricted to
/// competitors being ranked. The result does not depend on input order.
pub fn convert(
    table: &PointsTable,
    marks: &[(CompetitorId, Mark)],
) -> Result<BTreeMap<CompetitorId, JudgeAward>, TabulationError> {
    let mut sorted: Vec<(CompetitorId, Mark)> = marks.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut awards = BTreeMap::new();
    let mut start = 0;
    while start < sorted.len() {
        let mark = sorted[start].1;
        let end = sorted[start..]
            .iter()
            .position(|(_, m)| *m != mark)
            .map_or(sorted.len(), |n| start + n);

        // Placements start+1 ..= end share their combined points.
        let total: u128 = (start + 1..=end)
            .map(|placement| u128::from(table.points_for(placement).micros()))
            .sum();
        let points = split(total, (end - start) as u128)?;
        let placement = u32::try_from(start + 1).map_err(|_| TabulationError::PointsOverflow)?;

        for (competitor, mark) in &sorted[start..end] {
            awards.insert(
                *competitor,
                JudgeAward {
                    placement,
                    points,
                    mark: *mark,
                },
            );
        }
        start = end;
    }
    Ok(awards)
}
