//! Shared builders for E2E and property tests.

use std::sync::Arc;

use feis_core::ledger::MemoryLedger;
use feis_core::roster::Roster;
use feis_core::types::{
    CompetitionId, CompetitionSpec, CompetitorId, Dance, JudgeId, Level, OriginId, Presence,
    RoundId, RoundSpec,
};
use feis_node_lib::{Node, NodeConfig};
use feis_sync::outbox::{MemoryAckStore, Outbox};
use feis_sync::protocol::ScoreSubmission;

pub const COMPETITION: CompetitionId = CompetitionId(1);

/// Roster with one competition holding one round per entry of `rounds`,
/// numbered from `RoundId(10)` in sequence order. Every round shares the
/// same panel and entrants.
pub fn roster(rounds: usize, judges: &[u64], competitors: &[u64]) -> Roster {
    let roster = Roster::new();
    roster
        .add_competition(CompetitionSpec {
            id: COMPETITION,
            name: "Open Championship".into(),
            level: Level::Open,
        })
        .unwrap();
    for i in 0..rounds {
        let round = RoundId(10 + i as u64);
        roster
            .add_round(RoundSpec {
                id: round,
                competition: COMPETITION,
                sequence: i as u32 + 1,
                dance: Dance::Reel,
                judges: judges.iter().copied().map(JudgeId).collect(),
            })
            .unwrap();
        for c in competitors {
            roster
                .enter(round, CompetitorId(*c), Presence::Present)
                .unwrap();
        }
    }
    roster
}

/// In-memory results server over `roster` with default settings.
pub fn node(roster: Roster) -> Arc<Node> {
    Node::in_memory(roster, &NodeConfig::default()).unwrap()
}

/// Live submission without device metadata.
pub fn sub(round: u64, competitor: u64, judge: u64, mark: f64) -> ScoreSubmission {
    ScoreSubmission {
        round_id: RoundId(round),
        competitor_id: CompetitorId(competitor),
        judge_id: JudgeId(judge),
        raw_mark: mark,
        client_timestamp_ms: 1_000,
        origin: None,
        sequence: None,
    }
}

/// Submission as an outbox device would send it.
pub fn device_sub(
    origin: &str,
    sequence: u64,
    timestamp_ms: u64,
    (round, competitor, judge): (u64, u64, u64),
    mark: f64,
) -> ScoreSubmission {
    ScoreSubmission {
        client_timestamp_ms: timestamp_ms,
        origin: Some(OriginId::new(origin)),
        sequence: Some(sequence),
        ..sub(round, competitor, judge, mark)
    }
}

/// Judging device with its own in-memory ledger and outbox.
pub fn device(origin: &str) -> Outbox {
    Outbox::new(
        OriginId::new(origin),
        Arc::new(MemoryLedger::new()),
        Arc::new(MemoryAckStore::new()),
    )
    .unwrap()
}
