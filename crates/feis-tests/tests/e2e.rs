//! End-to-end tests for Feis.
//!
//! Each test boots an in-memory results server, feeds it marks the way
//! judging devices do (live, in offline batches, or over JSON-RPC), and
//! checks the ranked results, recall sheets, and reconciliation outcomes.

use std::collections::BTreeMap;
use std::time::Duration;

use jsonrpsee::core::client::{Error as ClientError, Subscription};

use feis_core::traits::ScoreLedger;
use feis_core::types::{
    CompetitorId, ConflictResolution, JudgeId, OriginId, PanelSize, Points, RoundId, ScoreKey,
};
use feis_node_lib::start_rpc_server;
use feis_sync::api::FeisRpcClient;
use feis_sync::outbox::{Authority, SubmitOutcome, SubmitRouter};
use feis_sync::protocol::{
    CorrectionRequest, ERR_NOT_FOUND, ItemStatus, MessageKind, RecallRequest, ResolveRequest,
    ResultsMessage, ScoreSubmission,
};
use feis_sync::RpcRemote;
use feis_tabulate::recall::compute_recall;
use feis_tabulate::results::{ResultRow, RoundResults};
use feis_tests::helpers::*;

fn points(whole: u64) -> Points {
    Points::from_whole(whole)
}

fn ranks(results: &RoundResults) -> Vec<(u64, u32)> {
    results.rows.iter().map(|r| (r.competitor.0, r.rank)).collect()
}

async fn next_message(feed: &mut Subscription<ResultsMessage>) -> ResultsMessage {
    tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .expect("no message within 5s")
        .expect("subscription closed")
        .expect("unreadable message")
}

// ---------------------------------------------------------------------------
// Tabulation
// ---------------------------------------------------------------------------

#[test]
fn three_judge_panel_sums_converted_points() {
    // Competitors A..E are 1..5.
    let node = node(roster(1, &[1, 2, 3], &[1, 2, 3, 4, 5]));
    let panel = [
        (1, [90.0, 85.0, 80.0, 75.0, 70.0]),
        (2, [80.0, 88.0, 82.0, 70.0, 75.0]),
        (3, [95.0, 80.0, 78.0, 72.0, 71.0]),
    ];

    for (judge, marks) in &panel[..2] {
        for (i, mark) in marks.iter().enumerate() {
            node.submit_score(sub(10, i as u64 + 1, *judge, *mark)).unwrap();
        }
    }
    let partial = node.round_results(RoundId(10)).unwrap();
    assert!(partial.provisional());
    assert_eq!(partial.judge_count, 2);

    // Judge 1 alone converts to the standard table.
    let a = partial.row(CompetitorId(1)).unwrap();
    assert_eq!(a.judge_points[&JudgeId(1)], points(100));
    let e = partial.row(CompetitorId(5)).unwrap();
    assert_eq!(e.judge_points[&JudgeId(1)], points(56));

    // Third judge marks everyone but E: still provisional.
    let (judge, marks) = &panel[2];
    for (i, mark) in marks.iter().enumerate().take(4) {
        node.submit_score(sub(10, i as u64 + 1, *judge, *mark)).unwrap();
    }
    let almost = node.round_results(RoundId(10)).unwrap();
    assert!(almost.provisional());
    assert!(almost.rows.iter().all(|r| r.provisional));

    node.submit_score(sub(10, 5, 3, marks[4])).unwrap();
    let results = node.round_results(RoundId(10)).unwrap();
    assert!(!results.provisional());
    assert!(results.rows.iter().all(|r| !r.provisional));
    assert_eq!(results.panel_size, PanelSize::Three);
    assert_eq!(results.judge_count, 3);

    // A: 100+65+100, B: 75+100+75, C: 65+75+65, D: 60+56+60, E: 56+60+56.
    let expected = [(1, 265), (2, 250), (3, 205), (4, 176), (5, 172)];
    for (rank, (competitor, total)) in expected.iter().enumerate() {
        let row = &results.rows[rank];
        assert_eq!(row.competitor, CompetitorId(*competitor));
        assert_eq!(row.rank, rank as u32 + 1);
        assert_eq!(row.points, points(*total));
        assert!(row.dropped.is_empty());
    }
}

#[test]
fn tie_for_second_splits_points() {
    let competitors: Vec<u64> = (1..=10).collect();
    let node = node(roster(1, &[1], &competitors));
    let marks = [95.0, 90.0, 90.0, 85.0, 80.0, 75.0, 70.0, 65.0, 60.0, 55.0];
    for (c, mark) in competitors.iter().zip(marks) {
        node.submit_score(sub(10, *c, 1, mark)).unwrap();
    }

    let results = node.round_results(RoundId(10)).unwrap();
    assert_eq!(results.row(CompetitorId(1)).unwrap().points, points(100));
    assert_eq!(results.row(CompetitorId(2)).unwrap().points, points(70));
    assert_eq!(results.row(CompetitorId(3)).unwrap().points, points(70));
    assert_eq!(results.row(CompetitorId(2)).unwrap().rank, 2);
    assert_eq!(results.row(CompetitorId(3)).unwrap().rank, 2);
    // Next distinct mark takes fourth place value.
    assert_eq!(results.row(CompetitorId(4)).unwrap().points, points(60));
    assert_eq!(results.row(CompetitorId(4)).unwrap().rank, 4);
}

#[test]
fn identical_resubmission_changes_nothing() {
    let node = node(roster(1, &[1], &[1, 2]));
    node.submit_score(sub(10, 1, 1, 81.0)).unwrap();
    node.submit_score(sub(10, 2, 1, 79.0)).unwrap();
    let once = node.round_results(RoundId(10)).unwrap();

    let receipt = node.submit_score(sub(10, 1, 1, 81.0)).unwrap();
    assert!(receipt.is_accepted());
    assert_eq!(receipt.revision, Some(once.revision));
    assert_eq!(*node.round_results(RoundId(10)).unwrap(), *once);
}

#[test]
fn correction_is_audited_and_reranks() {
    let node = node(roster(1, &[1], &[1, 2]));
    node.submit_score(sub(10, 1, 1, 70.0)).unwrap();
    node.submit_score(sub(10, 2, 1, 75.0)).unwrap();
    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(2, 1), (1, 2)]);

    let record = node
        .correct_score(CorrectionRequest {
            round_id: RoundId(10),
            competitor_id: CompetitorId(1),
            judge_id: JudgeId(1),
            mark: Some(78.0),
            actor: "tabulator".into(),
            reason: "keyed 70 for 78".into(),
        })
        .unwrap();
    assert_eq!(record.actor, "tabulator");

    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(1, 1), (2, 2)]);
    assert_eq!(node.corrections(RoundId(10)).unwrap(), vec![record]);
}

// ---------------------------------------------------------------------------
// Recall
// ---------------------------------------------------------------------------

#[test]
fn recall_extends_through_tie_at_cut() {
    // 101 entrants; 51st and 52nd tie on cumulative points.
    let rows: Vec<ResultRow> = (1..=101u64)
        .map(|c| {
            let total = if c == 52 { 1_000 - 51 } else { 1_000 - c };
            ResultRow {
                competitor: CompetitorId(c),
                rank: c.min(51) as u32,
                points: points(total),
                provisional: false,
                judge_points: BTreeMap::new(),
                dropped: Vec::new(),
            }
        })
        .collect();
    let results = RoundResults {
        round: RoundId(10),
        competition: COMPETITION,
        revision: 7,
        rows,
        judge_count: 1,
        panel_size: PanelSize::One,
        panel_complete: true,
    };
    let entrants: Vec<CompetitorId> = (1..=101).map(CompetitorId).collect();

    let sheet = compute_recall(COMPETITION, 1, &[(1, &results)], &entrants, 50).unwrap();
    assert_eq!(sheet.cut_index, 51);
    assert_eq!(sheet.recalled_count, 52);
    assert!(sheet.recalled().any(|c| c == CompetitorId(52)));
    assert!(!sheet.recalled().any(|c| c == CompetitorId(53)));
    assert!(!sheet.provisional);
}

#[test]
fn published_recall_is_frozen_until_reopened() {
    let node = node(roster(2, &[1], &[1, 2, 3, 4]));
    for (c, mark) in [(1, 90.0), (2, 85.0), (3, 80.0), (4, 75.0)] {
        node.submit_score(sub(10, c, 1, mark)).unwrap();
    }
    let request = RecallRequest {
        competition_id: COMPETITION,
        through_round: 1,
        actor: "tabulator".into(),
        reason: None,
    };

    let published = node.publish_recall(&request).unwrap();
    assert!(published.published);
    assert_eq!(
        published.sheet.recalled().collect::<Vec<_>>(),
        [CompetitorId(1), CompetitorId(2)]
    );

    // A late correction does not move the published sheet, only flags it.
    node.correct_score(CorrectionRequest {
        round_id: RoundId(10),
        competitor_id: CompetitorId(3),
        judge_id: JudgeId(1),
        mark: Some(95.0),
        actor: "tabulator".into(),
        reason: "transposed digits".into(),
    })
    .unwrap();
    let frozen = node.recall(COMPETITION, 1).unwrap();
    assert!(frozen.stale);
    assert_eq!(frozen.sheet, published.sheet);
    assert!(node.publish_recall(&request).is_err());

    let reopen = RecallRequest {
        reason: Some("correction after publication".into()),
        ..request.clone()
    };
    let live = node.reopen_recall(&reopen).unwrap();
    assert!(!live.published);
    assert_eq!(
        live.sheet.recalled().collect::<Vec<_>>(),
        [CompetitorId(3), CompetitorId(1)]
    );

    let republished = node.publish_recall(&request).unwrap();
    assert!(republished.published);
    assert!(!republished.stale);
}

// ---------------------------------------------------------------------------
// Offline reconciliation
// ---------------------------------------------------------------------------

#[test]
fn replayed_batch_is_idempotent() {
    let node = node(roster(1, &[1, 2, 3], &[1, 2]));
    let batch = vec![
        device_sub("tablet-1", 1, 1_000, (10, 1, 1), 88.0),
        device_sub("tablet-1", 2, 1_100, (10, 2, 1), 84.0),
        device_sub("tablet-1", 3, 1_200, (10, 1, 1), 89.0),
    ];

    let first = node.submit_batch(batch.clone()).unwrap();
    assert_eq!(first[0].status, ItemStatus::Applied);
    assert_eq!(first[2].status, ItemStatus::Applied);
    let after_first = node.round_results(RoundId(10)).unwrap();

    // Retry after a lost response.
    let second = node.submit_batch(batch).unwrap();
    assert_eq!(second.len(), 3);
    assert!(
        second
            .iter()
            .all(|r| matches!(r.status, ItemStatus::Unchanged | ItemStatus::Stale))
    );
    let after_second = node.round_results(RoundId(10)).unwrap();
    assert_eq!(*after_second, *after_first);

    let key = ScoreKey::new(RoundId(10), CompetitorId(1), JudgeId(1));
    assert_eq!(node.ledger().get(&key).unwrap().unwrap().mark.value(), 89.0);
}

#[test]
fn resubmitted_mark_replaces_earlier_one() {
    let node = node(roster(1, &[1], &[1, 2]));
    node.submit_score(sub(10, 1, 1, 80.0)).unwrap();
    node.submit_score(sub(10, 2, 1, 81.0)).unwrap();
    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(2, 1), (1, 2)]);

    // Same judge fixes a mark through the batch path, with and without a
    // device origin but never a sequence.
    let plain = ScoreSubmission {
        client_timestamp_ms: 600_000,
        ..sub(10, 1, 1, 82.0)
    };
    let tagged = ScoreSubmission {
        origin: Some(OriginId::new("desk")),
        client_timestamp_ms: 600_000,
        ..sub(10, 2, 1, 79.0)
    };
    let retyped = ScoreSubmission {
        client_timestamp_ms: 700_000,
        ..tagged.clone()
    };
    let receipts = node
        .submit_batch(vec![plain, tagged, ScoreSubmission { raw_mark: 78.0, ..retyped }])
        .unwrap();
    assert!(receipts.iter().all(|r| r.status == ItemStatus::Applied));

    let cell = |c| ScoreKey::new(RoundId(10), CompetitorId(c), JudgeId(1));
    assert_eq!(node.ledger().get(&cell(1)).unwrap().unwrap().mark.value(), 82.0);
    assert_eq!(node.ledger().get(&cell(2)).unwrap().unwrap().mark.value(), 78.0);
    assert!(node.conflicts(None).unwrap().is_empty());
    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(1, 1), (2, 2)]);
}

#[test]
fn concurrent_offline_edits_held_for_review() {
    let node = node(roster(1, &[1], &[1, 2]));
    node.submit_score(sub(10, 2, 1, 82.0)).unwrap();

    let a = node
        .submit_batch(vec![device_sub("tablet-a", 1, 1_000, (10, 1, 1), 80.0)])
        .unwrap();
    assert_eq!(a[0].status, ItemStatus::Applied);
    let b = node
        .submit_batch(vec![device_sub("tablet-b", 1, 1_500, (10, 1, 1), 84.0)])
        .unwrap();
    assert_eq!(b[0].status, ItemStatus::Conflict);
    assert!(b[0].reason.is_some());

    // The held value stands until someone decides.
    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(2, 1), (1, 2)]);
    let open = node.conflicts(Some(RoundId(10))).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].authoritative.mark.value(), 80.0);

    // Replaying the contender records nothing new.
    node.submit_batch(vec![device_sub("tablet-b", 1, 1_500, (10, 1, 1), 84.0)])
        .unwrap();
    assert_eq!(node.conflicts(None).unwrap().len(), 1);

    node.resolve_conflict(ResolveRequest {
        round_id: RoundId(10),
        competitor_id: CompetitorId(1),
        judge_id: JudgeId(1),
        resolution: ConflictResolution::AcceptContender {
            origin: OriginId::new("tablet-b"),
        },
        actor: "tabulator".into(),
        reason: "judge confirmed 84".into(),
    })
    .unwrap();
    assert!(node.conflicts(None).unwrap().is_empty());
    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(1, 1), (2, 2)]);

    // A late replay of the losing device cannot undo the decision.
    let late = node
        .submit_batch(vec![device_sub("tablet-a", 1, 1_000, (10, 1, 1), 80.0)])
        .unwrap();
    assert_eq!(late[0].status, ItemStatus::Stale);
    assert_eq!(ranks(&node.round_results(RoundId(10)).unwrap()), [(1, 1), (2, 2)]);
}

// ---------------------------------------------------------------------------
// Over the wire
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_results_reach_subscribers_over_rpc() {
    let node = node(roster(1, &[1], &[100, 101]));
    let (addr, handle) = start_rpc_server("127.0.0.1:0", node.clone()).await.unwrap();
    let remote = RpcRemote::connect(&format!("ws://{addr}")).await.unwrap();

    let mut feed = FeisRpcClient::subscribe_round(remote.client(), RoundId(10))
        .await
        .unwrap();
    let first = next_message(&mut feed).await;
    assert_eq!(first.kind, MessageKind::Snapshot);
    assert!(first.results.provisional());

    let receipt = FeisRpcClient::submit_score(remote.client(), sub(10, 100, 1, 88.0))
        .await
        .unwrap();
    assert!(receipt.is_accepted());
    let changed = next_message(&mut feed).await;
    assert_eq!(changed.kind, MessageKind::Changed);
    assert_eq!(Some(changed.revision()), receipt.revision);
    assert_eq!(changed.results.rows[0].competitor, CompetitorId(100));

    // Invalid marks come back as rejected receipts, not call errors.
    let rejected = FeisRpcClient::submit_score(remote.client(), sub(10, 101, 1, 101.0))
        .await
        .unwrap();
    assert!(!rejected.is_accepted());

    match FeisRpcClient::get_round_results(remote.client(), RoundId(99)).await {
        Err(ClientError::Call(obj)) => assert_eq!(obj.code(), ERR_NOT_FOUND),
        other => panic!("expected not-found, got {other:?}"),
    }

    handle.stop().unwrap();
}

#[tokio::test]
async fn device_reconciles_backlog_then_goes_live() {
    let node = node(roster(1, &[1], &[100, 101]));
    let (addr, handle) = start_rpc_server("127.0.0.1:0", node.clone()).await.unwrap();
    let remote = RpcRemote::connect(&format!("ws://{addr}")).await.unwrap();
    let router = SubmitRouter::new(device("tablet-1"), remote, Duration::from_secs(5));
    assert_eq!(router.authority(), Authority::Local);

    let key = |c| ScoreKey::new(RoundId(10), CompetitorId(c), JudgeId(1));
    for (c, mark) in [(100, 80.0), (101, 75.0)] {
        let outcome = router.submit(key(c), mark, 1_000).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Local);
    }
    assert_eq!(router.outbox().pending().unwrap().len(), 2);
    assert!(node.ledger().rounds().unwrap().is_empty());

    let report = router.reconcile().await.unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(report.applied, 2);
    assert_eq!(router.authority(), Authority::Remote);
    assert!(router.outbox().pending().unwrap().is_empty());

    let again = router.reconcile().await.unwrap();
    assert_eq!(again.sent, 0);

    match router.submit(key(101), 86.0, 2_000).await.unwrap() {
        SubmitOutcome::Confirmed(receipt) => assert!(receipt.is_accepted()),
        other => panic!("expected confirmation, got {other:?}"),
    }
    assert!(router.outbox().pending().unwrap().is_empty());
    assert_eq!(
        ranks(&node.round_results(RoundId(10)).unwrap()),
        [(101, 1), (100, 2)]
    );

    handle.stop().unwrap();
}
