//! Request and response types exchanged over JSON-RPC.
//!
//! Marks arrive as plain numbers and are validated on the server, so a bad
//! mark is reported in a receipt instead of failing deserialization of the
//! whole request.

use serde::{Deserialize, Serialize};

use feis_core::constants::UNSEQUENCED;
use feis_core::error::LedgerError;
use feis_core::types::{
    CompetitionId, CompetitorId, ConflictResolution, JudgeId, Mark, MergeOutcome, OriginId,
    Presence, RoundId, Score, ScoreKey, TimestampMs, UpsertOutcome,
};
use feis_tabulate::recall::RecallSheet;
use feis_tabulate::results::RoundResults;

/// Invalid mark, unknown round, judge off panel, competitor not entered.
pub const ERR_INVALID_SCORE: i32 = -32001;
/// Requested round, competition, cell, or conflict does not exist.
pub const ERR_NOT_FOUND: i32 = -32004;
/// Recall publication state forbids the request.
pub const ERR_RECALL_STATE: i32 = -32009;
/// Storage or other server-side failure.
pub const ERR_INTERNAL: i32 = -32603;

/// One judge's mark for one competitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSubmission {
    pub round_id: RoundId,
    pub competitor_id: CompetitorId,
    pub judge_id: JudgeId,
    pub raw_mark: f64,
    /// Time the mark was entered on the device.
    pub client_timestamp_ms: TimestampMs,
    /// Submitting device; the server fills in a connection default.
    #[serde(default)]
    pub origin: Option<OriginId>,
    /// Per-origin counter, set by devices that keep an outbox.
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl ScoreSubmission {
    pub fn key(&self) -> ScoreKey {
        ScoreKey::new(self.round_id, self.competitor_id, self.judge_id)
    }

    /// Validate the mark and build the ledger score.
    pub fn into_score(self, default_origin: &OriginId) -> Result<Score, LedgerError> {
        let mark = Mark::new(self.raw_mark)?;
        Ok(Score {
            key: self.key(),
            mark,
            timestamp_ms: self.client_timestamp_ms,
            origin: self.origin.unwrap_or_else(|| default_origin.clone()),
            sequence: self.sequence.unwrap_or(UNSEQUENCED),
        })
    }

    pub fn from_score(score: &Score) -> Self {
        Self {
            round_id: score.key.round,
            competitor_id: score.key.competitor,
            judge_id: score.key.judge,
            raw_mark: score.mark.value(),
            client_timestamp_ms: score.timestamp_ms,
            origin: Some(score.origin.clone()),
            sequence: Some(score.sequence),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Accepted,
    Rejected,
}

/// Server answer to a single live submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub key: ScoreKey,
    pub status: ReceiptStatus,
    /// Results revision of the round after the write.
    #[serde(default)]
    pub revision: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SubmitReceipt {
    pub fn accepted(key: ScoreKey, revision: u64) -> Self {
        Self {
            key,
            status: ReceiptStatus::Accepted,
            revision: Some(revision),
            reason: None,
        }
    }

    pub fn rejected(key: ScoreKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            status: ReceiptStatus::Rejected,
            revision: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ReceiptStatus::Accepted
    }
}

/// Per-item reconciliation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Applied,
    Unchanged,
    Stale,
    /// Kept for review; the server's value stands for now.
    Conflict,
    Rejected,
}

impl From<&UpsertOutcome> for ItemStatus {
    fn from(outcome: &UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Inserted | UpsertOutcome::Replaced { .. } => Self::Applied,
            UpsertOutcome::Unchanged => Self::Unchanged,
        }
    }
}

impl From<&MergeOutcome> for ItemStatus {
    fn from(outcome: &MergeOutcome) -> Self {
        match outcome {
            MergeOutcome::Applied => Self::Applied,
            MergeOutcome::Unchanged => Self::Unchanged,
            MergeOutcome::Stale => Self::Stale,
            MergeOutcome::Conflict(_) => Self::Conflict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemReceipt {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub key: ScoreKey,
    pub status: ItemStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Full state sent when a subscription starts or resynchronizes.
    Snapshot,
    /// Full replacement after a change.
    Changed,
}

/// Item pushed on a round subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsMessage {
    pub kind: MessageKind,
    pub results: RoundResults,
}

impl ResultsMessage {
    pub fn snapshot(results: RoundResults) -> Self {
        Self {
            kind: MessageKind::Snapshot,
            results,
        }
    }

    pub fn changed(results: RoundResults) -> Self {
        Self {
            kind: MessageKind::Changed,
            results,
        }
    }

    pub fn revision(&self) -> u64 {
        self.results.revision
    }
}

/// Recall sheet plus its publication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallView {
    /// The published sheet when published, otherwise freshly computed.
    pub sheet: RecallSheet,
    pub published: bool,
    #[serde(default)]
    pub published_at_ms: Option<TimestampMs>,
    /// Published, but an input round has changed since.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub round_id: RoundId,
    pub competitor_id: CompetitorId,
    pub judge_id: JudgeId,
    /// New mark; `None` removes the score.
    #[serde(default)]
    pub mark: Option<f64>,
    pub actor: String,
    pub reason: String,
}

impl CorrectionRequest {
    pub fn key(&self) -> ScoreKey {
        ScoreKey::new(self.round_id, self.competitor_id, self.judge_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub round_id: RoundId,
    pub competitor_id: CompetitorId,
    pub judge_id: JudgeId,
    pub resolution: ConflictResolution,
    pub actor: String,
    pub reason: String,
}

impl ResolveRequest {
    pub fn key(&self) -> ScoreKey {
        ScoreKey::new(self.round_id, self.competitor_id, self.judge_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRequest {
    pub round_id: RoundId,
    pub competitor_id: CompetitorId,
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallRequest {
    pub competition_id: CompetitionId,
    pub through_round: u32,
    pub actor: String,
    /// Required when reopening.
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_defaults_origin() {
        let json = r#"{
            "round_id": 1, "competitor_id": 2, "judge_id": 3,
            "raw_mark": 81.5, "client_timestamp_ms": 1000
        }"#;
        let sub: ScoreSubmission = serde_json::from_str(json).unwrap();
        let score = sub.into_score(&OriginId::new("conn-7")).unwrap();
        assert_eq!(score.origin, OriginId::new("conn-7"));
        assert!(!score.is_sequenced());
        assert_eq!(score.mark.value(), 81.5);
    }

    #[test]
    fn submission_out_of_range_rejected() {
        let sub = ScoreSubmission {
            round_id: RoundId(1),
            competitor_id: CompetitorId(2),
            judge_id: JudgeId(3),
            raw_mark: 140.0,
            client_timestamp_ms: 0,
            origin: None,
            sequence: None,
        };
        assert!(matches!(
            sub.into_score(&OriginId::new("x")),
            Err(LedgerError::MarkOutOfRange { .. })
        ));
    }

    #[test]
    fn submission_preserves_score_identity() {
        let score = Score {
            key: ScoreKey::new(RoundId(1), CompetitorId(2), JudgeId(3)),
            mark: Mark::new(64.0).unwrap(),
            timestamp_ms: 55,
            origin: OriginId::new("tablet-2"),
            sequence: 9,
        };
        let back = ScoreSubmission::from_score(&score)
            .into_score(&OriginId::new("other"))
            .unwrap();
        assert!(back.same_write(&score));
    }

    #[test]
    fn resolution_wire_format() {
        let req: ResolveRequest = serde_json::from_str(
            r#"{"round_id":1,"competitor_id":2,"judge_id":3,
                "resolution":{"kind":"accept_contender","origin":"tablet-4"},
                "actor":"chief","reason":"confirmed"}"#,
        )
        .unwrap();
        assert_eq!(
            req.resolution,
            ConflictResolution::AcceptContender {
                origin: OriginId::new("tablet-4")
            }
        );
    }
}
