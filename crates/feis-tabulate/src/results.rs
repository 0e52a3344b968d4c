//! Round results: conversion, aggregation, and ranking of one round.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use feis_core::error::{FeisError, TabulationError};
use feis_core::types::{
    CompetitionId, CompetitorId, JudgeId, Mark, PanelSize, Points, Presence, RoundId,
    RoundSnapshot, RoundSpec,
};

use crate::panel::{self, CompetitorTally};
use crate::points::{self, JudgeAward, PointsTable};
use crate::tiebreak::TieBreakPolicy;

/// How competitors marked as no-shows are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoShowPolicy {
    /// Left out of the ranking entirely.
    #[default]
    Exclude,
    /// Ranked last with zero points.
    ScoreZero,
}

impl fmt::Display for NoShowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exclude => "exclude",
            Self::ScoreZero => "score_zero",
        })
    }
}

impl FromStr for NoShowPolicy {
    type Err = TabulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclude" => Ok(Self::Exclude),
            "score_zero" => Ok(Self::ScoreZero),
            other => Err(TabulationError::UnknownNoShowPolicy(other.to_string())),
        }
    }
}

/// Tabulation knobs shared by the server and every device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulationSettings {
    pub table: PointsTable,
    pub tie_break: TieBreakPolicy,
    pub no_show: NoShowPolicy,
}

/// One ranked competitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub competitor: CompetitorId,
    pub rank: u32,
    pub points: Points,
    /// Set while any panel judge has yet to mark any ranked competitor.
    pub provisional: bool,
    /// Points from each judge who has marked this competitor.
    pub judge_points: BTreeMap<JudgeId, Points>,
    /// Judges discarded as the high or low award.
    pub dropped: Vec<JudgeId>,
}

/// Ranked results of one round at one revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResults {
    pub round: RoundId,
    pub competition: CompetitionId,
    /// Ledger revision plus roster revision; grows with every change that
    /// can alter the results.
    pub revision: u64,
    pub rows: Vec<ResultRow>,
    /// Panel judges who have submitted at least one counted mark.
    pub judge_count: usize,
    pub panel_size: PanelSize,
    pub panel_complete: bool,
}

impl RoundResults {
    pub fn row(&self, competitor: CompetitorId) -> Option<&ResultRow> {
        self.rows.iter().find(|r| r.competitor == competitor)
    }

    pub fn provisional(&self) -> bool {
        !self.panel_complete
    }
}

/// Tabulate one round from a ledger snapshot.
///
/// Only `Present` competitors are converted and ranked. Marks from judges
/// off the panel, or for competitors not present, are ignored.
pub fn tabulate_round(
    spec: &RoundSpec,
    entries: &BTreeMap<CompetitorId, Presence>,
    snapshot: &RoundSnapshot,
    roster_revision: u64,
    settings: &TabulationSettings,
) -> Result<RoundResults, FeisError> {
    let panel = spec.panel_size()?;
    let present: BTreeSet<CompetitorId> = entries
        .iter()
        .filter(|(_, p)| **p == Presence::Present)
        .map(|(c, _)| *c)
        .collect();

    let mut by_judge: BTreeMap<JudgeId, Vec<(CompetitorId, Mark)>> =
        spec.judges.iter().map(|j| (*j, Vec::new())).collect();
    for score in &snapshot.scores {
        let key = score.key;
        match by_judge.get_mut(&key.judge) {
            Some(marks) if present.contains(&key.competitor) => {
                marks.push((key.competitor, score.mark))
            }
            _ => debug!(%key, "mark not counted: judge off panel or competitor not present"),
        }
    }

    let mut awards: BTreeMap<CompetitorId, BTreeMap<JudgeId, JudgeAward>> =
        present.iter().map(|c| (*c, BTreeMap::new())).collect();
    let mut judges_reporting = 0;
    let mut complete = !present.is_empty();
    for (judge, marks) in &by_judge {
        if !marks.is_empty() {
            judges_reporting += 1;
        }
        if marks.len() < present.len() {
            complete = false;
        }
        for (competitor, award) in points::convert(&settings.table, marks)? {
            if let Some(per_judge) = awards.get_mut(&competitor) {
                per_judge.insert(*judge, award);
            }
        }
    }

    let tallies = awards
        .into_iter()
        .map(|(competitor, a)| panel::aggregate(panel, competitor, a))
        .collect::<Result<Vec<CompetitorTally>, _>>()?;
    let ranked = panel::rank(tallies, &settings.tie_break);

    let provisional = !complete;
    let mut rows: Vec<ResultRow> = ranked
        .into_iter()
        .map(|r| ResultRow {
            competitor: r.tally.competitor,
            rank: r.rank,
            points: r.tally.aggregate,
            provisional,
            judge_points: r
                .tally
                .awards
                .iter()
                .map(|(j, a)| (*j, a.points))
                .collect(),
            dropped: r.tally.dropped,
        })
        .collect();

    if settings.no_show == NoShowPolicy::ScoreZero {
        let last = rows.len() as u32 + 1;
        rows.extend(
            entries
                .iter()
                .filter(|(_, p)| **p == Presence::NoShow)
                .map(|(c, _)| ResultRow {
                    competitor: *c,
                    rank: last,
                    points: Points::ZERO,
                    provisional,
                    judge_points: BTreeMap::new(),
                    dropped: Vec::new(),
                }),
        );
    }

    Ok(RoundResults {
        round: spec.id,
        competition: spec.competition,
        revision: snapshot.revision + roster_revision,
        rows,
        judge_count: judges_reporting,
        panel_size: panel,
        panel_complete: complete,
    })
}
