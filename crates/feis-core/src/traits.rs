//! Trait interfaces for the Feis engine.
//!
//! - [`ScoreLedger`]: the single source of truth for raw marks
//!   ([`MemoryLedger`](crate::ledger::MemoryLedger) here, `RocksLedger` in feis-node)
//! - [`RosterSource`]: rounds, entries, and presence supplied by registration
//!   and check-in ([`Roster`](crate::roster::Roster) here)

use std::collections::BTreeMap;

use crate::error::{FeisError, RosterError};
use crate::types::{
    CompetitionId, CompetitionSpec, CompetitorId, ConflictResolution, Correction,
    CorrectionRecord, MergeOutcome, MergePolicy, OriginId, Presence, RoundId, RoundSnapshot,
    RoundSpec, Score, ScoreKey, SyncConflict, TimestampMs, UpsertOutcome,
};

/// Store of raw marks keyed by `(round, competitor, judge)`.
///
/// Every write addresses a single cell and is atomic on its own; writes to
/// different cells never wait on each other beyond the brief per-round
/// critical section needed to keep snapshots consistent.
pub trait ScoreLedger: Send + Sync {
    /// Write a score, replacing any previous value for its cell.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MarkOutOfRange`](crate::error::LedgerError::MarkOutOfRange)
    ///   if the mark fails validation; nothing is stored.
    fn upsert(&self, score: Score) -> Result<UpsertOutcome, FeisError>;

    /// Merge a score produced while its device was offline.
    ///
    /// Follows [`merge::decide`](crate::merge::decide). Ambiguous writes
    /// leave the cell untouched and record a [`SyncConflict`].
    fn merge(&self, score: Score, policy: &MergePolicy) -> Result<MergeOutcome, FeisError>;

    /// Current value of one cell.
    fn get(&self, key: &ScoreKey) -> Result<Option<Score>, FeisError>;

    /// Point-in-time view of a round. Unknown rounds yield an empty snapshot
    /// at revision 0.
    fn snapshot(&self, round: RoundId) -> Result<RoundSnapshot, FeisError>;

    /// Revision counter of a round; bumped by every effective change.
    fn revision(&self, round: RoundId) -> Result<u64, FeisError>;

    /// Rounds holding at least one cell, correction, or conflict.
    fn rounds(&self) -> Result<Vec<RoundId>, FeisError>;

    /// Privileged overwrite or removal, recorded in the audit trail.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MissingAuditTrail`](crate::error::LedgerError::MissingAuditTrail)
    ///   if actor or reason is blank
    /// - [`LedgerError::CellNotFound`](crate::error::LedgerError::CellNotFound)
    ///   when removing a cell that holds nothing
    fn correct(&self, correction: Correction) -> Result<CorrectionRecord, FeisError>;

    /// Audit trail of a round, oldest first.
    fn corrections(&self, round: RoundId) -> Result<Vec<CorrectionRecord>, FeisError>;

    /// Open conflicts of a round.
    fn conflicts(&self, round: RoundId) -> Result<Vec<SyncConflict>, FeisError>;

    /// Settle every open conflict on a cell. Recorded like a correction.
    fn resolve_conflict(
        &self,
        key: &ScoreKey,
        resolution: ConflictResolution,
        actor: &str,
        reason: &str,
        at_ms: TimestampMs,
    ) -> Result<CorrectionRecord, FeisError>;

    /// Open conflicts across all rounds.
    fn all_conflicts(&self) -> Result<Vec<SyncConflict>, FeisError> {
        let mut out = Vec::new();
        for round in self.rounds()? {
            out.extend(self.conflicts(round)?);
        }
        Ok(out)
    }

    /// Every stored cell whose current value came from `origin`.
    fn scores_by_origin(&self, origin: &OriginId) -> Result<Vec<Score>, FeisError> {
        let mut out = Vec::new();
        for round in self.rounds()? {
            out.extend(
                self.snapshot(round)?
                    .scores
                    .into_iter()
                    .filter(|s| &s.origin == origin),
            );
        }
        Ok(out)
    }
}

/// Rounds, entries, and presence, as supplied by registration and check-in.
pub trait RosterSource: Send + Sync {
    fn competition(&self, id: CompetitionId) -> Result<CompetitionSpec, RosterError>;

    fn round(&self, id: RoundId) -> Result<RoundSpec, RosterError>;

    /// Rounds of a competition ordered by sequence.
    fn competition_rounds(&self, id: CompetitionId) -> Result<Vec<RoundSpec>, RosterError>;

    /// Entered competitors of a round with their presence.
    fn entries(&self, round: RoundId) -> Result<BTreeMap<CompetitorId, Presence>, RosterError>;

    /// Change counter for a round's entries/presence.
    fn roster_revision(&self, round: RoundId) -> Result<u64, RosterError>;

    /// Everyone entered in any round of the competition.
    fn competition_entrants(&self, id: CompetitionId) -> Result<Vec<CompetitorId>, RosterError> {
        let mut all = std::collections::BTreeSet::new();
        for round in self.competition_rounds(id)? {
            all.extend(self.entries(round.id)?.into_keys());
        }
        Ok(all.into_iter().collect())
    }

    /// Reject submissions for unknown rounds, competitors not entered in
    /// the round, or judges not on its panel.
    fn validate_key(&self, key: &ScoreKey) -> Result<(), RosterError> {
        let round = self.round(key.round)?;
        if !round.has_judge(key.judge) {
            return Err(RosterError::JudgeNotOnPanel {
                round: key.round,
                judge: key.judge,
            });
        }
        if !self.entries(key.round)?.contains_key(&key.competitor) {
            return Err(RosterError::NotEntered {
                round: key.round,
                competitor: key.competitor,
            });
        }
        Ok(())
    }
}
