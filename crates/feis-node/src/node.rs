//! Results server composition.
//!
//! The [`Node`] wires the ledger, roster, results cache, recall store, and
//! broadcast fan-out together. Every handler is a plain synchronous call;
//! the only side effect beyond the ledger write is publishing the round's
//! new results to its subscribers.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use feis_core::error::{FeisError, LedgerError};
use feis_core::ledger::MemoryLedger;
use feis_core::roster::{Roster, RosterArchive};
use feis_core::traits::{RosterSource, ScoreLedger};
use feis_core::types::{
    CompetitionId, Correction, CorrectionRecord, JudgeId, Mark, MergePolicy, OriginId, RoundId,
    ScoreKey, SyncConflict, now_ms,
};
use feis_sync::broadcast::RoundBroadcaster;
use feis_sync::protocol::{
    BatchItemReceipt, CorrectionRequest, ItemStatus, PresenceRequest, RecallRequest, RecallView,
    ResolveRequest, ScoreSubmission, SubmitReceipt,
};
use feis_tabulate::recall::{RecallSheet, compute_recall};
use feis_tabulate::results::{RoundResults, TabulationSettings, tabulate_round};

use crate::cache::ResultsCache;
use crate::config::NodeConfig;
use crate::recall_store::RecallStore;
use crate::storage::RocksLedger;

/// Origin given to live submissions that do not name their device.
fn live_origin(judge: JudgeId) -> OriginId {
    OriginId::new(format!("judge:{judge}"))
}

/// The results server.
pub struct Node {
    ledger: Arc<dyn ScoreLedger>,
    roster: Arc<Roster>,
    settings: TabulationSettings,
    merge_policy: MergePolicy,
    recall_percent: u32,
    cache: ResultsCache,
    recalls: RecallStore,
    broadcaster: RoundBroadcaster,
    roster_archive: Option<Arc<dyn RosterArchive>>,
    /// Orders check-in writes so the archive never holds an older state.
    presence_lock: Mutex<()>,
}

impl Node {
    /// Open the persistent ledger under `config.data_dir` and load the
    /// roster, if one is configured, with its saved check-in changes.
    pub fn open(config: &NodeConfig) -> Result<Arc<Self>, FeisError> {
        config.validate()?;
        let roster = match &config.roster_path {
            Some(path) => Roster::load(path)?,
            None => {
                warn!("no roster configured; every submission will be rejected");
                Roster::new()
            }
        };
        let ledger = Arc::new(RocksLedger::open(config.db_path())?);
        roster.restore_from(&*ledger)?;
        let recalls = RecallStore::with_archive(ledger.clone())?;
        let archive: Arc<dyn RosterArchive> = ledger.clone();
        Self::assemble(ledger, Arc::new(roster), recalls, Some(archive), config)
    }

    /// A node holding everything in memory.
    pub fn in_memory(roster: Roster, config: &NodeConfig) -> Result<Arc<Self>, FeisError> {
        config.validate()?;
        Self::assemble(
            Arc::new(MemoryLedger::new()),
            Arc::new(roster),
            RecallStore::in_memory(),
            None,
            config,
        )
    }

    fn assemble(
        ledger: Arc<dyn ScoreLedger>,
        roster: Arc<Roster>,
        recalls: RecallStore,
        roster_archive: Option<Arc<dyn RosterArchive>>,
        config: &NodeConfig,
    ) -> Result<Arc<Self>, FeisError> {
        let settings = config.tabulation()?;
        info!(
            tie_break = %settings.tie_break,
            no_show = %settings.no_show,
            recall_percent = config.recall_percent,
            conflict_window_ms = config.conflict_window_ms,
            "node assembled"
        );
        Ok(Arc::new(Self {
            ledger,
            roster,
            settings,
            merge_policy: config.merge_policy(),
            recall_percent: config.recall_percent,
            cache: ResultsCache::new(),
            recalls,
            broadcaster: RoundBroadcaster::new(config.broadcast_capacity),
            roster_archive,
            presence_lock: Mutex::new(()),
        }))
    }

    pub fn ledger(&self) -> &Arc<dyn ScoreLedger> {
        &self.ledger
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn settings(&self) -> &TabulationSettings {
        &self.settings
    }

    pub fn broadcaster(&self) -> &RoundBroadcaster {
        &self.broadcaster
    }

    // --- Ingestion ---

    /// Record one live score. Invalid submissions come back as rejected
    /// receipts; only storage failures are errors.
    pub fn submit_score(&self, submission: ScoreSubmission) -> Result<SubmitReceipt, FeisError> {
        let key = submission.key();
        if let Err(e) = self.roster.validate_key(&key) {
            warn!(%key, error = %e, "submission rejected");
            return Ok(SubmitReceipt::rejected(key, e.to_string()));
        }
        let score = match submission.into_score(&live_origin(key.judge)) {
            Ok(score) => score,
            Err(e) => {
                warn!(%key, error = %e, "submission rejected");
                return Ok(SubmitReceipt::rejected(key, e.to_string()));
            }
        };

        let outcome = self.ledger.upsert(score)?;
        let results = if outcome.changed() {
            self.publish_update(key.round)?
        } else {
            self.round_results(key.round)?
        };
        debug!(%key, ?outcome, revision = results.revision, "score submitted");
        Ok(SubmitReceipt::accepted(key, results.revision))
    }

    /// Merge a device's offline scores. Each item is merged on its own;
    /// one receipt per item, in order. Items that name no origin overwrite
    /// the cell like a live submission.
    pub fn submit_batch(
        &self,
        batch: Vec<ScoreSubmission>,
    ) -> Result<Vec<BatchItemReceipt>, FeisError> {
        let mut receipts = Vec::with_capacity(batch.len());
        let mut touched: BTreeSet<RoundId> = BTreeSet::new();

        for (index, submission) in batch.into_iter().enumerate() {
            let key = submission.key();
            let rejected = |reason: String| BatchItemReceipt {
                index,
                key,
                status: ItemStatus::Rejected,
                reason: Some(reason),
            };
            if let Err(e) = self.roster.validate_key(&key) {
                receipts.push(rejected(e.to_string()));
                continue;
            }
            // Items without a device origin are plain resubmissions.
            let from_device = submission.origin.is_some();
            let score = match submission.into_score(&live_origin(key.judge)) {
                Ok(score) => score,
                Err(e) => {
                    receipts.push(rejected(e.to_string()));
                    continue;
                }
            };

            let (changed, status) = if from_device {
                let outcome = self.ledger.merge(score, &self.merge_policy)?;
                (outcome.changed(), ItemStatus::from(&outcome))
            } else {
                let outcome = self.ledger.upsert(score)?;
                (outcome.changed(), ItemStatus::from(&outcome))
            };
            if changed {
                touched.insert(key.round);
            }
            receipts.push(BatchItemReceipt {
                index,
                key,
                status,
                reason: (status == ItemStatus::Conflict)
                    .then(|| "held for review; server value kept".to_string()),
            });
        }

        let rejected = receipts
            .iter()
            .filter(|r| r.status == ItemStatus::Rejected)
            .count();
        info!(
            items = receipts.len(),
            rejected,
            rounds = touched.len(),
            "batch reconciled"
        );
        for round in touched {
            self.publish_update(round)?;
        }
        Ok(receipts)
    }

    // --- Queries ---

    /// Combined ledger and roster revision of a round.
    fn results_revision(&self, round: RoundId) -> Result<u64, FeisError> {
        Ok(self.ledger.revision(round)? + self.roster.roster_revision(round)?)
    }

    /// Current results of a round, recomputed only when its revision moved.
    pub fn round_results(&self, round: RoundId) -> Result<Arc<RoundResults>, FeisError> {
        let spec = self.roster.round(round)?;
        if let Some(hit) = self.cache.get(round, self.results_revision(round)?) {
            return Ok(hit);
        }
        let entries = self.roster.entries(round)?;
        let roster_revision = self.roster.roster_revision(round)?;
        let snapshot = self.ledger.snapshot(round)?;
        let results = tabulate_round(&spec, &entries, &snapshot, roster_revision, &self.settings)?;
        debug!(%round, revision = results.revision, rows = results.rows.len(), "round tabulated");
        Ok(self.cache.insert(results))
    }

    /// Recompute a round and push the new results to its subscribers.
    fn publish_update(&self, round: RoundId) -> Result<Arc<RoundResults>, FeisError> {
        let results = self.round_results(round)?;
        self.broadcaster.publish(results.as_ref().clone());
        Ok(results)
    }

    /// Subscribe to a round's results. The receiver is registered before
    /// the returned snapshot is read.
    pub fn subscribe(
        &self,
        round: RoundId,
    ) -> Result<(broadcast::Receiver<Arc<RoundResults>>, Arc<RoundResults>), FeisError> {
        self.roster.round(round)?;
        let rx = self.broadcaster.subscribe(round);
        let current = self.round_results(round)?;
        Ok((rx, current))
    }

    /// Drop broadcast channels without subscribers.
    pub fn prune_subscriptions(&self) -> usize {
        self.broadcaster.prune()
    }

    // --- Recall ---

    fn recall_sheet(
        &self,
        competition: CompetitionId,
        through_round: u32,
    ) -> Result<RecallSheet, FeisError> {
        let mut computed = Vec::new();
        for spec in self.roster.competition_rounds(competition)? {
            if spec.sequence <= through_round {
                computed.push((spec.sequence, self.round_results(spec.id)?));
            }
        }
        let rounds: Vec<(u32, &RoundResults)> =
            computed.iter().map(|(seq, r)| (*seq, r.as_ref())).collect();
        let entrants = self.roster.competition_entrants(competition)?;
        compute_recall(
            competition,
            through_round,
            &rounds,
            &entrants,
            self.recall_percent,
        )
    }

    /// Recall for a competition: the published sheet if frozen (flagged
    /// stale once its inputs change), otherwise a fresh computation.
    pub fn recall(
        &self,
        competition: CompetitionId,
        through_round: u32,
    ) -> Result<RecallView, FeisError> {
        let current = self.recall_sheet(competition, through_round)?;
        Ok(self.recalls.view(current))
    }

    pub fn publish_recall(&self, request: &RecallRequest) -> Result<RecallView, FeisError> {
        let sheet = self.recall_sheet(request.competition_id, request.through_round)?;
        self.recalls.publish(sheet, &request.actor, now_ms())?;
        self.recall(request.competition_id, request.through_round)
    }

    pub fn reopen_recall(&self, request: &RecallRequest) -> Result<RecallView, FeisError> {
        let reason = request.reason.as_deref().unwrap_or_default();
        self.recalls.reopen(
            request.competition_id,
            request.through_round,
            &request.actor,
            reason,
        )?;
        self.recall(request.competition_id, request.through_round)
    }

    // --- Administration ---

    pub fn correct_score(&self, request: CorrectionRequest) -> Result<CorrectionRecord, FeisError> {
        let key = request.key();
        self.roster.validate_key(&key)?;
        let mark = request.mark.map(Mark::new).transpose()?;
        let record = self.ledger.correct(Correction {
            key,
            mark,
            actor: request.actor,
            reason: request.reason,
            timestamp_ms: now_ms(),
        })?;
        self.publish_update(key.round)?;
        Ok(record)
    }

    pub fn conflicts(&self, round: Option<RoundId>) -> Result<Vec<SyncConflict>, FeisError> {
        match round {
            Some(round) => self.ledger.conflicts(round),
            None => self.ledger.all_conflicts(),
        }
    }

    pub fn resolve_conflict(&self, request: ResolveRequest) -> Result<CorrectionRecord, FeisError> {
        let key: ScoreKey = request.key();
        let record = self.ledger.resolve_conflict(
            &key,
            request.resolution,
            &request.actor,
            &request.reason,
            now_ms(),
        )?;
        self.publish_update(key.round)?;
        Ok(record)
    }

    pub fn corrections(&self, round: RoundId) -> Result<Vec<CorrectionRecord>, FeisError> {
        self.roster.round(round)?;
        self.ledger.corrections(round)
    }

    /// Check-in change; returns the round's results afterwards.
    pub fn set_presence(&self, request: PresenceRequest) -> Result<Arc<RoundResults>, FeisError> {
        let round = request.round_id;
        {
            let _guard = self.presence_lock.lock();
            let before = self.roster.roster_revision(round)?;
            let after = self
                .roster
                .set_presence(round, request.competitor_id, request.presence)?;
            if let Some(archive) = self.roster_archive.as_ref().filter(|_| after != before) {
                archive.save_presence(&self.roster.round_presence(round)?)?;
            }
        }
        self.publish_update(round)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("settings", &self.settings)
            .field("recall_percent", &self.recall_percent)
            .field("cached_rounds", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feis_core::error::{RecallError, RosterError};
    use feis_core::types::{CompetitorId, ConflictResolution, Presence};
    use feis_sync::protocol::ReceiptStatus;

    const ROSTER: &str = r#"{
        "competitions": [{ "id": 1, "name": "U12 Preliminary Championship", "level": "preliminary" }],
        "rounds": [
            { "id": 10, "competition": 1, "sequence": 1, "dance": "reel", "judges": [1, 2, 3],
              "entries": [{ "competitor": 100 }, { "competitor": 101 }, { "competitor": 102 }] },
            { "id": 11, "competition": 1, "sequence": 2, "dance": "treble_jig", "judges": [1, 2, 3],
              "entries": [{ "competitor": 100 }, { "competitor": 101 }, { "competitor": 102 }] }
        ]
    }"#;

    fn node() -> Arc<Node> {
        Node::in_memory(Roster::from_json(ROSTER).unwrap(), &NodeConfig::default()).unwrap()
    }

    fn sub(round: u64, competitor: u64, judge: u64, mark: f64) -> ScoreSubmission {
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

    fn mark_round(node: &Node, round: u64) {
        for judge in 1..=3 {
            for (competitor, mark) in [(100, 90.0), (101, 80.0), (102, 70.0)] {
                node.submit_score(sub(round, competitor, judge, mark)).unwrap();
            }
        }
    }

    #[test]
    fn submit_rejects_invalid_without_error() {
        let node = node();
        let off_panel = node.submit_score(sub(10, 100, 9, 80.0)).unwrap();
        assert_eq!(off_panel.status, ReceiptStatus::Rejected);
        let out_of_range = node.submit_score(sub(10, 100, 1, 140.0)).unwrap();
        assert_eq!(out_of_range.status, ReceiptStatus::Rejected);
        assert!(node.ledger().snapshot(RoundId(10)).unwrap().scores.is_empty());
    }

    #[test]
    fn receipt_revision_tracks_results() {
        let node = node();
        let first = node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        let replay = node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        assert!(first.is_accepted());
        assert_eq!(first.revision, replay.revision);
        let results = node.round_results(RoundId(10)).unwrap();
        assert_eq!(Some(results.revision), first.revision);
        assert!(results.provisional());
    }

    #[test]
    fn results_cached_until_revision_moves() {
        let node = node();
        node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        let a = node.round_results(RoundId(10)).unwrap();
        let b = node.round_results(RoundId(10)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        node.submit_score(sub(10, 101, 1, 85.0)).unwrap();
        let c = node.round_results(RoundId(10)).unwrap();
        assert!(c.revision > a.revision);
    }

    #[tokio::test]
    async fn subscribers_receive_changes() {
        let node = node();
        let (mut rx, first) = node.subscribe(RoundId(10)).unwrap();
        node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        let next = rx.recv().await.unwrap();
        assert!(next.revision > first.revision);
    }

    #[test]
    fn subscribe_unknown_round_fails() {
        assert!(matches!(
            node().subscribe(RoundId(99)).unwrap_err(),
            FeisError::Roster(RosterError::UnknownRound(_))
        ));
    }

    #[test]
    fn batch_reports_per_item() {
        let node = node();
        node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        let receipts = node
            .submit_batch(vec![
                sub(10, 100, 1, 80.0),
                sub(10, 101, 1, 75.0),
                sub(10, 999, 1, 75.0),
            ])
            .unwrap();
        let statuses: Vec<ItemStatus> = receipts.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ItemStatus::Unchanged, ItemStatus::Applied, ItemStatus::Rejected]
        );
        assert_eq!(receipts[2].index, 2);
    }

    #[test]
    fn batch_resubmission_replaces_earlier_mark() {
        let node = node();
        node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        let mut changed = sub(10, 100, 1, 82.0);
        changed.client_timestamp_ms = 600_000;
        let receipts = node.submit_batch(vec![changed, sub(10, 100, 1, 84.0)]).unwrap();
        assert_eq!(receipts[0].status, ItemStatus::Applied);
        assert_eq!(receipts[1].status, ItemStatus::Applied);

        let key = ScoreKey::new(RoundId(10), CompetitorId(100), JudgeId(1));
        assert_eq!(node.ledger().get(&key).unwrap().unwrap().mark.value(), 84.0);
        assert!(node.conflicts(None).unwrap().is_empty());
    }

    #[test]
    fn conflict_resolution_flow() {
        let node = node();
        let mut live = sub(10, 100, 1, 80.0);
        live.origin = Some(OriginId::new("tablet-a"));
        node.submit_score(live).unwrap();

        let mut offline = sub(10, 100, 1, 84.0);
        offline.origin = Some(OriginId::new("tablet-b"));
        offline.client_timestamp_ms = 1_500;
        let receipts = node.submit_batch(vec![offline]).unwrap();
        assert_eq!(receipts[0].status, ItemStatus::Conflict);
        assert_eq!(node.conflicts(None).unwrap().len(), 1);

        node.resolve_conflict(ResolveRequest {
            round_id: RoundId(10),
            competitor_id: CompetitorId(100),
            judge_id: JudgeId(1),
            resolution: ConflictResolution::AcceptContender {
                origin: OriginId::new("tablet-b"),
            },
            actor: "steward".into(),
            reason: "confirmed with judge".into(),
        })
        .unwrap();
        assert!(node.conflicts(Some(RoundId(10))).unwrap().is_empty());
        assert_eq!(node.corrections(RoundId(10)).unwrap().len(), 1);
    }

    #[test]
    fn correction_requires_audit_trail() {
        let node = node();
        node.submit_score(sub(10, 100, 1, 80.0)).unwrap();
        let err = node
            .correct_score(CorrectionRequest {
                round_id: RoundId(10),
                competitor_id: CompetitorId(100),
                judge_id: JudgeId(1),
                mark: Some(70.0),
                actor: "tab".into(),
                reason: " ".into(),
            })
            .unwrap_err();
        assert!(matches!(err, FeisError::Ledger(LedgerError::MissingAuditTrail)));
    }

    #[test]
    fn presence_change_republishes() {
        let node = node();
        mark_round(&node, 10);
        let before = node.round_results(RoundId(10)).unwrap();
        assert_eq!(before.rows.len(), 3);
        let after = node
            .set_presence(PresenceRequest {
                round_id: RoundId(10),
                competitor_id: CompetitorId(102),
                presence: Presence::Absent,
            })
            .unwrap();
        assert_eq!(after.rows.len(), 2);
        assert!(after.revision > before.revision);
    }

    #[test]
    fn recall_publish_and_stale() {
        let node = node();
        let request = RecallRequest {
            competition_id: CompetitionId(1),
            through_round: 2,
            actor: "tab".into(),
            reason: None,
        };
        mark_round(&node, 10);
        // Round 2 unmarked: provisional, cannot be frozen.
        assert!(matches!(
            node.publish_recall(&request).unwrap_err(),
            FeisError::Recall(RecallError::Provisional { .. })
        ));

        mark_round(&node, 11);
        let published = node.publish_recall(&request).unwrap();
        assert!(published.published);
        assert!(!published.stale);
        assert_eq!(published.sheet.recalled_count, 2);

        node.correct_score(CorrectionRequest {
            round_id: RoundId(11),
            competitor_id: CompetitorId(102),
            judge_id: JudgeId(1),
            mark: Some(99.0),
            actor: "tab".into(),
            reason: "transcription error".into(),
        })
        .unwrap();
        let view = node.recall(CompetitionId(1), 2).unwrap();
        assert!(view.published);
        assert!(view.stale);

        let reopened = node
            .reopen_recall(&RecallRequest {
                reason: Some("republish after correction".into()),
                ..request
            })
            .unwrap();
        assert!(!reopened.published);
    }
}
