//! In-memory score ledger and the cell-change rules shared by every ledger.
//!
//! [`MemoryLedger`] shards rounds across a [`DashMap`]; each round's cells
//! sit behind their own `RwLock`, held only for the single map operation a
//! write needs. Snapshots therefore see either all or none of a write, and
//! writes to different rounds never contend. Used by judging devices and
//! tests; the server persists through `RocksLedger` (feis-node).

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::constants::UNSEQUENCED;
use crate::error::{FeisError, LedgerError};
use crate::merge::{self, MergeDecision};
use crate::traits::ScoreLedger;
use crate::types::{
    CompetitorId, ConflictResolution, Correction, CorrectionRecord, JudgeId, Mark, MergeOutcome,
    MergePolicy, OriginId, RoundId, RoundSnapshot, Score, ScoreKey, SyncConflict, TimestampMs,
    UpsertOutcome, now_ms,
};

/// Planned effect of a correction or conflict resolution on one cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellChange {
    /// New cell value; `None` removes the cell.
    pub value: Option<Score>,
    /// Audit entry; `revision` is filled in by the ledger when applied.
    pub record: CorrectionRecord,
}

fn require_audit(actor: &str, reason: &str) -> Result<(), LedgerError> {
    if actor.trim().is_empty() || reason.trim().is_empty() {
        return Err(LedgerError::MissingAuditTrail);
    }
    Ok(())
}

fn admin_score(key: ScoreKey, mark: Mark, actor: &str, at_ms: TimestampMs) -> Score {
    Score {
        key,
        mark,
        timestamp_ms: at_ms,
        origin: OriginId::admin(actor),
        sequence: UNSEQUENCED,
    }
}

/// Plan an administrative correction against the cell's current value.
pub fn plan_correction(
    current: Option<&Score>,
    correction: &Correction,
) -> Result<CellChange, LedgerError> {
    require_audit(&correction.actor, &correction.reason)?;
    if let Some(mark) = &correction.mark {
        mark.validate()?;
    } else if current.is_none() {
        return Err(LedgerError::CellNotFound(correction.key.to_string()));
    }

    let value = correction
        .mark
        .map(|mark| admin_score(correction.key, mark, &correction.actor, correction.timestamp_ms));

    Ok(CellChange {
        value,
        record: CorrectionRecord {
            key: correction.key,
            previous: current.map(|s| s.mark),
            new: correction.mark,
            actor: correction.actor.clone(),
            reason: correction.reason.clone(),
            timestamp_ms: correction.timestamp_ms,
            revision: 0,
        },
    })
}

/// Plan the settlement of every open conflict on a cell.
///
/// The settled value is restamped with the admin origin and `at_ms`, so a
/// later replay of either side's original write is older than the
/// settlement and merges as stale instead of reopening the conflict.
pub fn plan_resolution(
    key: &ScoreKey,
    current: Option<&Score>,
    open: &[SyncConflict],
    resolution: &ConflictResolution,
    actor: &str,
    reason: &str,
    at_ms: TimestampMs,
) -> Result<CellChange, LedgerError> {
    require_audit(actor, reason)?;
    if open.is_empty() {
        return Err(LedgerError::ConflictNotFound(key.to_string()));
    }

    let mark = match resolution {
        ConflictResolution::KeepAuthoritative => current.map(|s| s.mark),
        ConflictResolution::AcceptContender { origin } => {
            let contender = open
                .iter()
                .rev()
                .find(|c| &c.contender.origin == origin)
                .ok_or_else(|| LedgerError::UnknownContender {
                    key: key.to_string(),
                    origin: origin.to_string(),
                })?;
            Some(contender.contender.mark)
        }
        ConflictResolution::Override { mark } => {
            mark.validate()?;
            Some(*mark)
        }
    };

    Ok(CellChange {
        value: mark.map(|m| admin_score(*key, m, actor, at_ms)),
        record: CorrectionRecord {
            key: *key,
            previous: current.map(|s| s.mark),
            new: mark,
            actor: actor.to_string(),
            reason: reason.to_string(),
            timestamp_ms: at_ms,
            revision: 0,
        },
    })
}

type Cell = (CompetitorId, JudgeId);

fn cell_of(key: &ScoreKey) -> Cell {
    (key.competitor, key.judge)
}

#[derive(Default)]
struct RoundCells {
    revision: u64,
    cells: BTreeMap<Cell, Score>,
    corrections: Vec<CorrectionRecord>,
    conflicts: BTreeMap<Cell, Vec<SyncConflict>>,
}

/// In-memory [`ScoreLedger`].
#[derive(Default)]
pub struct MemoryLedger {
    rounds: DashMap<RoundId, Arc<RwLock<RoundCells>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create a round's cells. The shard guard is released before
    /// the caller takes the round lock.
    fn round_cells(&self, round: RoundId) -> Arc<RwLock<RoundCells>> {
        Arc::clone(self.rounds.entry(round).or_default().value())
    }

    fn existing_round(&self, round: RoundId) -> Option<Arc<RwLock<RoundCells>>> {
        self.rounds.get(&round).map(|r| Arc::clone(r.value()))
    }

    /// Total number of stored cells.
    pub fn len(&self) -> usize {
        self.rounds
            .iter()
            .map(|r| r.value().read().cells.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ScoreLedger for MemoryLedger {
    fn upsert(&self, score: Score) -> Result<UpsertOutcome, FeisError> {
        score.mark.validate()?;
        let key = score.key;
        let round = self.round_cells(key.round);
        let mut cells = round.write();

        let outcome = match cells.cells.get(&cell_of(&key)) {
            Some(existing) if existing.mark == score.mark => UpsertOutcome::Unchanged,
            Some(existing) => UpsertOutcome::Replaced {
                previous: existing.mark,
            },
            None => UpsertOutcome::Inserted,
        };

        if outcome.changed() {
            cells.cells.insert(cell_of(&key), score);
            cells.revision += 1;
            debug!(%key, revision = cells.revision, "upserted score");
        }
        Ok(outcome)
    }

    fn merge(&self, score: Score, policy: &MergePolicy) -> Result<MergeOutcome, FeisError> {
        score.mark.validate()?;
        let key = score.key;
        let round = self.round_cells(key.round);
        let mut cells = round.write();
        let cell = cell_of(&key);

        match merge::decide(cells.cells.get(&cell), &score, policy) {
            MergeDecision::Apply => {
                cells.cells.insert(cell, score);
                cells.revision += 1;
                debug!(%key, revision = cells.revision, "merged score");
                Ok(MergeOutcome::Applied)
            }
            MergeDecision::Unchanged => Ok(MergeOutcome::Unchanged),
            MergeDecision::Stale => Ok(MergeOutcome::Stale),
            MergeDecision::Conflict => {
                let current = cells
                    .cells
                    .get(&cell)
                    .cloned()
                    .ok_or_else(|| FeisError::Storage(format!("conflict on empty cell {key}")))?;
                let open = cells.conflicts.entry(cell).or_default();
                if let Some(existing) = open.iter().find(|c| c.contender.same_write(&score)) {
                    return Ok(MergeOutcome::Conflict(existing.clone()));
                }
                let conflict = merge::conflict(&current, &score, now_ms());
                warn!(
                    %key,
                    held = %current.mark,
                    held_origin = %current.origin,
                    incoming = %score.mark,
                    incoming_origin = %score.origin,
                    "sync conflict recorded for review"
                );
                open.push(conflict.clone());
                Ok(MergeOutcome::Conflict(conflict))
            }
        }
    }

    fn get(&self, key: &ScoreKey) -> Result<Option<Score>, FeisError> {
        Ok(self
            .existing_round(key.round)
            .and_then(|r| r.read().cells.get(&cell_of(key)).cloned()))
    }

    fn snapshot(&self, round: RoundId) -> Result<RoundSnapshot, FeisError> {
        let Some(cells) = self.existing_round(round) else {
            return Ok(RoundSnapshot {
                round,
                ..RoundSnapshot::default()
            });
        };
        let cells = cells.read();
        Ok(RoundSnapshot {
            round,
            revision: cells.revision,
            scores: cells.cells.values().cloned().collect(),
        })
    }

    fn revision(&self, round: RoundId) -> Result<u64, FeisError> {
        Ok(self
            .existing_round(round)
            .map(|r| r.read().revision)
            .unwrap_or(0))
    }

    fn rounds(&self) -> Result<Vec<RoundId>, FeisError> {
        let mut rounds: Vec<RoundId> = self.rounds.iter().map(|r| *r.key()).collect();
        rounds.sort();
        Ok(rounds)
    }

    fn correct(&self, correction: Correction) -> Result<CorrectionRecord, FeisError> {
        let key = correction.key;
        let round = self.round_cells(key.round);
        let mut cells = round.write();
        let cell = cell_of(&key);

        let change = plan_correction(cells.cells.get(&cell), &correction)?;
        match change.value {
            Some(score) => {
                cells.cells.insert(cell, score);
            }
            None => {
                // Nothing left to review on a removed cell.
                cells.cells.remove(&cell);
                cells.conflicts.remove(&cell);
            }
        }
        cells.revision += 1;
        let record = CorrectionRecord {
            revision: cells.revision,
            ..change.record
        };
        info!(%key, actor = %record.actor, reason = %record.reason, "administrative correction");
        cells.corrections.push(record.clone());
        Ok(record)
    }

    fn corrections(&self, round: RoundId) -> Result<Vec<CorrectionRecord>, FeisError> {
        Ok(self
            .existing_round(round)
            .map(|r| r.read().corrections.clone())
            .unwrap_or_default())
    }

    fn conflicts(&self, round: RoundId) -> Result<Vec<SyncConflict>, FeisError> {
        Ok(self
            .existing_round(round)
            .map(|r| r.read().conflicts.values().flatten().cloned().collect())
            .unwrap_or_default())
    }

    fn resolve_conflict(
        &self,
        key: &ScoreKey,
        resolution: ConflictResolution,
        actor: &str,
        reason: &str,
        at_ms: TimestampMs,
    ) -> Result<CorrectionRecord, FeisError> {
        let round = self.round_cells(key.round);
        let mut cells = round.write();
        let cell = cell_of(key);
        let open = cells.conflicts.get(&cell).cloned().unwrap_or_default();

        let change = plan_resolution(
            key,
            cells.cells.get(&cell),
            &open,
            &resolution,
            actor,
            reason,
            at_ms,
        )?;
        match change.value {
            Some(score) => {
                cells.cells.insert(cell, score);
            }
            None => {
                cells.cells.remove(&cell);
            }
        }
        cells.conflicts.remove(&cell);
        cells.revision += 1;
        let record = CorrectionRecord {
            revision: cells.revision,
            ..change.record
        };
        info!(%key, actor, ?resolution, "sync conflict resolved");
        cells.corrections.push(record.clone());
        Ok(record)
    }
}
