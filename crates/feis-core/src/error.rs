//! Error types for the Feis tabulation engine.
use thiserror::Error;

use crate::types::{CompetitionId, CompetitorId, JudgeId, RoundId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("mark {mark} outside [{min}, {max}]")] MarkOutOfRange { mark: f64, min: f64, max: f64 },
    #[error("mark is not a finite number")] MarkNotFinite,
    #[error("no score stored for {0}")] CellNotFound(String),
    #[error("no open conflict for {0}")] ConflictNotFound(String),
    #[error("no contender from origin {origin} for {key}")] UnknownContender { key: String, origin: String },
    #[error("administrative actions require an actor and a reason")] MissingAuditTrail,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("unknown round: {0}")] UnknownRound(RoundId),
    #[error("unknown competition: {0}")] UnknownCompetition(CompetitionId),
    #[error("competitor {competitor} is not entered in round {round}")] NotEntered { round: RoundId, competitor: CompetitorId },
    #[error("judge {judge} is not on the panel for round {round}")] JudgeNotOnPanel { round: RoundId, judge: JudgeId },
    #[error("panel of {0} judges; panels must have 1, 3, or 5")] InvalidPanelSize(usize),
    #[error("duplicate judge {judge} on round {round}")] DuplicateJudge { round: RoundId, judge: JudgeId },
    #[error("duplicate round: {0}")] DuplicateRound(RoundId),
    #[error("duplicate competition: {0}")] DuplicateCompetition(CompetitionId),
    #[error("duplicate round sequence {sequence} in competition {competition}")] DuplicateSequence { competition: CompetitionId, sequence: u32 },
    #[error("roster parse: {0}")] Parse(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TabulationError {
    #[error("invalid points table: {0}")] InvalidPointsTable(String),
    #[error("points overflow")] PointsOverflow,
    #[error("unknown tie-break policy: {0}")] UnknownTieBreak(String),
    #[error("unknown no-show policy: {0}")] UnknownNoShowPolicy(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecallError {
    #[error("recall percent must be within 1..=100, got {0}")] InvalidPercent(u32),
    #[error("no rounds at or before sequence {through_round} in competition {competition}")] NoRounds { competition: CompetitionId, through_round: u32 },
    #[error("recall for competition {competition} through round {through_round} is provisional")] Provisional { competition: CompetitionId, through_round: u32 },
    #[error("recall for competition {competition} through round {through_round} is already published")] AlreadyPublished { competition: CompetitionId, through_round: u32 },
    #[error("recall for competition {competition} through round {through_round} is not published")] NotPublished { competition: CompetitionId, through_round: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("request timed out; outcome unknown")] Timeout,
    #[error("transport: {0}")] Transport(String),
    #[error("server rejected request: {0}")] Rejected(String),
    #[error("receipt count {got} does not match batch size {expected}")] ReceiptMismatch { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum FeisError {
    #[error(transparent)] Ledger(#[from] LedgerError),
    #[error(transparent)] Roster(#[from] RosterError),
    #[error(transparent)] Tabulation(#[from] TabulationError),
    #[error(transparent)] Recall(#[from] RecallError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error("storage: {0}")] Storage(String),
}
