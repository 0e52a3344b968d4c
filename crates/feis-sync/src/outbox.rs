//! A judging device's offline outbox and submit routing.
//!
//! Every mark entered on a device is written to the device's own ledger
//! first, with the same upsert rules as the server, and tracked as pending
//! until the server acknowledges it. [`SubmitRouter`] decides which ledger
//! is authoritative: the server while reachable, the device otherwise.
//! Authority only returns to the server once the outbox has fully drained,
//! so the two ledgers are never both taking writes for the same device.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use feis_core::error::{FeisError, SyncError};
use feis_core::traits::ScoreLedger;
use feis_core::types::{Mark, OriginId, Score, ScoreKey, TimestampMs};

use crate::protocol::{BatchItemReceipt, ItemStatus, ScoreSubmission, SubmitReceipt};

/// Durable record of which local writes the server has not yet confirmed.
pub trait AckStore: Send + Sync {
    /// Note that `key` was written locally with `sequence`.
    fn mark_pending(&self, key: ScoreKey, sequence: u64) -> Result<(), FeisError>;

    /// Clear `key` if its pending write is no newer than `sequence`.
    /// Returns whether it was cleared.
    fn acknowledge(&self, key: &ScoreKey, sequence: u64) -> Result<bool, FeisError>;

    /// Pending keys with the sequence of their latest local write.
    fn pending_keys(&self) -> Result<Vec<(ScoreKey, u64)>, FeisError>;

    /// Highest sequence ever issued by this device.
    fn last_sequence(&self) -> Result<u64, FeisError>;

    fn set_last_sequence(&self, sequence: u64) -> Result<(), FeisError>;
}

#[derive(Default)]
struct AckState {
    pending: BTreeMap<ScoreKey, u64>,
    last_sequence: u64,
}

/// In-memory [`AckStore`] for tests and ephemeral devices.
#[derive(Default)]
pub struct MemoryAckStore {
    state: Mutex<AckState>,
}

impl MemoryAckStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AckStore for MemoryAckStore {
    fn mark_pending(&self, key: ScoreKey, sequence: u64) -> Result<(), FeisError> {
        self.state.lock().pending.insert(key, sequence);
        Ok(())
    }

    fn acknowledge(&self, key: &ScoreKey, sequence: u64) -> Result<bool, FeisError> {
        let mut state = self.state.lock();
        match state.pending.get(key) {
            Some(&pending) if pending <= sequence => {
                state.pending.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn pending_keys(&self) -> Result<Vec<(ScoreKey, u64)>, FeisError> {
        Ok(self
            .state
            .lock()
            .pending
            .iter()
            .map(|(k, s)| (*k, *s))
            .collect())
    }

    fn last_sequence(&self) -> Result<u64, FeisError> {
        Ok(self.state.lock().last_sequence)
    }

    fn set_last_sequence(&self, sequence: u64) -> Result<(), FeisError> {
        let mut state = self.state.lock();
        state.last_sequence = state.last_sequence.max(sequence);
        Ok(())
    }
}

/// A device's local ledger plus its pending-acknowledgement set.
pub struct Outbox {
    origin: OriginId,
    ledger: Arc<dyn ScoreLedger>,
    acks: Arc<dyn AckStore>,
    sequence: Mutex<u64>,
}

impl Outbox {
    pub fn new(
        origin: OriginId,
        ledger: Arc<dyn ScoreLedger>,
        acks: Arc<dyn AckStore>,
    ) -> Result<Self, FeisError> {
        let last = acks.last_sequence()?;
        Ok(Self {
            origin,
            ledger,
            acks,
            sequence: Mutex::new(last),
        })
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn ledger(&self) -> &Arc<dyn ScoreLedger> {
        &self.ledger
    }

    /// Write a mark to the local ledger and mark it pending.
    ///
    /// An identical resubmission leaves the ledger and the outbox as they
    /// were and returns the stored score.
    pub fn record(
        &self,
        key: ScoreKey,
        mark: Mark,
        timestamp_ms: TimestampMs,
    ) -> Result<Score, FeisError> {
        let mut seq = self.sequence.lock();
        if let Some(existing) = self.ledger.get(&key)? {
            if existing.mark == mark {
                return Ok(existing);
            }
        }

        let next = *seq + 1;
        let score = Score {
            key,
            mark,
            timestamp_ms,
            origin: self.origin.clone(),
            sequence: next,
        };
        self.ledger.upsert(score.clone())?;
        self.acks.set_last_sequence(next)?;
        self.acks.mark_pending(key, next)?;
        *seq = next;
        debug!(%key, sequence = next, "recorded locally");
        Ok(score)
    }

    /// Current local value of every unacknowledged cell.
    pub fn pending(&self) -> Result<Vec<Score>, FeisError> {
        let mut out = Vec::new();
        for (key, sequence) in self.acks.pending_keys()? {
            match self.ledger.get(&key)? {
                Some(score) => out.push(score),
                // Removed locally; nothing left to send.
                None => {
                    self.acks.acknowledge(&key, sequence)?;
                }
            }
        }
        Ok(out)
    }

    /// Mark one score as received by the server.
    pub fn acknowledge(&self, score: &Score) -> Result<bool, FeisError> {
        self.acks.acknowledge(&score.key, score.sequence)
    }

    /// Apply batch receipts to the scores that were sent. Every receipt,
    /// rejected ones included, settles its item: a rejected score can never
    /// succeed on retry.
    pub fn apply_receipts(
        &self,
        sent: &[Score],
        receipts: &[BatchItemReceipt],
    ) -> Result<usize, FeisError> {
        if sent.len() != receipts.len() {
            return Err(SyncError::ReceiptMismatch {
                expected: sent.len(),
                got: receipts.len(),
            }
            .into());
        }
        let mut cleared = 0;
        for receipt in receipts {
            let Some(score) = sent.get(receipt.index) else {
                return Err(SyncError::ReceiptMismatch {
                    expected: sent.len(),
                    got: receipt.index + 1,
                }
                .into());
            };
            if receipt.status == ItemStatus::Rejected {
                warn!(
                    key = %score.key,
                    reason = receipt.reason.as_deref().unwrap_or(""),
                    "server rejected offline score"
                );
            }
            if self.acknowledge(score)? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

/// Server side of a device's submissions.
pub trait RemoteLedger: Send + Sync {
    fn submit(
        &self,
        submission: ScoreSubmission,
    ) -> impl Future<Output = Result<SubmitReceipt, SyncError>> + Send;

    fn submit_batch(
        &self,
        batch: Vec<ScoreSubmission>,
    ) -> impl Future<Output = Result<Vec<BatchItemReceipt>, SyncError>> + Send;
}

/// Which ledger is authoritative for this device's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Local,
    Remote,
}

/// Result of one routed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Server accepted the score.
    Confirmed(SubmitReceipt),
    /// Server refused the score; it will not be retried.
    Rejected(SubmitReceipt),
    /// Stored locally only; sent on the next reconciliation.
    Local,
    /// The server did not answer in time. The score is stored locally and
    /// stays pending; reconciliation settles it either way.
    Unknown,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub sent: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub stale: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub receipts: Vec<BatchItemReceipt>,
}

impl ReconcileReport {
    fn count(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Applied => self.applied += 1,
            ItemStatus::Unchanged => self.unchanged += 1,
            ItemStatus::Stale => self.stale += 1,
            ItemStatus::Conflict => self.conflicts += 1,
            ItemStatus::Rejected => self.rejected += 1,
        }
    }
}

/// Routes a device's submissions between its outbox and the server.
pub struct SubmitRouter<R: RemoteLedger> {
    outbox: Outbox,
    remote: R,
    authority: RwLock<Authority>,
    timeout: Duration,
}

impl<R: RemoteLedger> SubmitRouter<R> {
    /// Starts with local authority; the first successful reconciliation
    /// hands it to the server.
    pub fn new(outbox: Outbox, remote: R, timeout: Duration) -> Self {
        Self {
            outbox,
            remote,
            authority: RwLock::new(Authority::Local),
            timeout,
        }
    }

    pub fn authority(&self) -> Authority {
        *self.authority.read()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn fall_back(&self, why: &str) {
        let mut authority = self.authority.write();
        if *authority == Authority::Remote {
            warn!(why, "server unreachable, switching to local authority");
        }
        *authority = Authority::Local;
    }

    /// Record a mark locally, then forward it when the server is
    /// authoritative.
    pub async fn submit(
        &self,
        key: ScoreKey,
        raw_mark: f64,
        timestamp_ms: TimestampMs,
    ) -> Result<SubmitOutcome, FeisError> {
        let mark = Mark::new(raw_mark)?;
        let score = self.outbox.record(key, mark, timestamp_ms)?;
        if self.authority() == Authority::Local {
            return Ok(SubmitOutcome::Local);
        }

        let submission = ScoreSubmission::from_score(&score);
        match tokio::time::timeout(self.timeout, self.remote.submit(submission)).await {
            Ok(Ok(receipt)) if receipt.is_accepted() => {
                self.outbox.acknowledge(&score)?;
                Ok(SubmitOutcome::Confirmed(receipt))
            }
            Ok(Ok(receipt)) => {
                self.outbox.acknowledge(&score)?;
                Ok(SubmitOutcome::Rejected(receipt))
            }
            Ok(Err(e)) => {
                self.fall_back(&e.to_string());
                Ok(SubmitOutcome::Local)
            }
            Err(_) => {
                self.fall_back("submit timed out");
                Ok(SubmitOutcome::Unknown)
            }
        }
    }

    /// Send every pending score in one batch. Authority moves to the server
    /// only when nothing is left pending afterwards.
    pub async fn reconcile(&self) -> Result<ReconcileReport, FeisError> {
        let pending = self.outbox.pending()?;
        let mut report = ReconcileReport {
            sent: pending.len(),
            ..ReconcileReport::default()
        };

        if !pending.is_empty() {
            let batch: Vec<ScoreSubmission> =
                pending.iter().map(ScoreSubmission::from_score).collect();
            let receipts = match tokio::time::timeout(self.timeout, self.remote.submit_batch(batch))
                .await
            {
                Ok(Ok(receipts)) => receipts,
                Ok(Err(e)) => {
                    self.fall_back(&e.to_string());
                    return Err(e.into());
                }
                Err(_) => {
                    self.fall_back("reconcile timed out");
                    return Err(SyncError::Timeout.into());
                }
            };
            self.outbox.apply_receipts(&pending, &receipts)?;
            for receipt in &receipts {
                report.count(receipt.status);
            }
            report.receipts = receipts;
        }

        if self.outbox.pending()?.is_empty() {
            let mut authority = self.authority.write();
            if *authority == Authority::Local {
                info!(sent = report.sent, "outbox drained, server is authoritative");
            }
            *authority = Authority::Remote;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReceiptStatus;
    use feis_core::ledger::MemoryLedger;
    use feis_core::types::{CompetitorId, JudgeId, MergePolicy, RoundId};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Remote backed by a server-side ledger that merges like the node does.
    struct FakeRemote {
        ledger: MemoryLedger,
        online: AtomicBool,
        hang: AtomicBool,
    }

    impl FakeRemote {
        fn new() -> Self {
            Self {
                ledger: MemoryLedger::new(),
                online: AtomicBool::new(true),
                hang: AtomicBool::new(false),
            }
        }

        async fn gate(&self) -> Result<(), SyncError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if !self.online.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("connection refused".into()));
            }
            Ok(())
        }
    }

    impl RemoteLedger for FakeRemote {
        async fn submit(&self, submission: ScoreSubmission) -> Result<SubmitReceipt, SyncError> {
            self.gate().await?;
            let key = submission.key();
            match submission.into_score(&OriginId::new("anon")) {
                Ok(score) => {
                    self.ledger
                        .upsert(score)
                        .map_err(|e| SyncError::Rejected(e.to_string()))?;
                    Ok(SubmitReceipt::accepted(key, self.ledger.revision(key.round).unwrap()))
                }
                Err(e) => Ok(SubmitReceipt::rejected(key, e.to_string())),
            }
        }

        async fn submit_batch(
            &self,
            batch: Vec<ScoreSubmission>,
        ) -> Result<Vec<BatchItemReceipt>, SyncError> {
            self.gate().await?;
            Ok(batch
                .into_iter()
                .enumerate()
                .map(|(index, sub)| {
                    let key = sub.key();
                    let score = sub.into_score(&OriginId::new("anon")).unwrap();
                    let outcome = self.ledger.merge(score, &MergePolicy::default()).unwrap();
                    BatchItemReceipt {
                        index,
                        key,
                        status: ItemStatus::from(&outcome),
                        reason: None,
                    }
                })
                .collect())
        }
    }

    fn key(c: u64) -> ScoreKey {
        ScoreKey::new(RoundId(1), CompetitorId(c), JudgeId(1))
    }

    fn router(remote: FakeRemote) -> SubmitRouter<FakeRemote> {
        let outbox = Outbox::new(
            OriginId::new("tablet-1"),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryAckStore::new()),
        )
        .unwrap();
        SubmitRouter::new(outbox, remote, Duration::from_millis(100))
    }

    #[test]
    fn record_assigns_increasing_sequences() {
        let outbox = Outbox::new(
            OriginId::new("t"),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryAckStore::new()),
        )
        .unwrap();
        let a = outbox.record(key(1), Mark::new(70.0).unwrap(), 1).unwrap();
        let b = outbox.record(key(1), Mark::new(72.0).unwrap(), 2).unwrap();
        let same = outbox.record(key(1), Mark::new(72.0).unwrap(), 3).unwrap();
        assert!(b.sequence > a.sequence);
        assert_eq!(same.sequence, b.sequence);
        assert_eq!(outbox.pending().unwrap().len(), 1);

        // Acknowledging the older write leaves the newer one pending.
        assert!(!outbox.acknowledge(&a).unwrap());
        assert!(outbox.acknowledge(&b).unwrap());
        assert!(outbox.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_scores_drain_on_reconcile() {
        let remote = FakeRemote::new();
        remote.online.store(false, Ordering::SeqCst);
        let r = router(remote);

        // Starts local: nothing leaves the device.
        assert_eq!(r.submit(key(1), 80.0, 1_000).await.unwrap(), SubmitOutcome::Local);
        assert_eq!(r.submit(key(2), 75.0, 1_100).await.unwrap(), SubmitOutcome::Local);
        assert!(r.reconcile().await.is_err());
        assert_eq!(r.authority(), Authority::Local);

        r.remote.online.store(true, Ordering::SeqCst);
        let report = r.reconcile().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(r.authority(), Authority::Remote);
        assert!(r.outbox().pending().unwrap().is_empty());

        // Replaying the same batch is harmless.
        let replay = r
            .remote
            .submit_batch(vec![ScoreSubmission::from_score(
                &r.outbox().ledger().get(&key(1)).unwrap().unwrap(),
            )])
            .await
            .unwrap();
        assert_eq!(replay[0].status, ItemStatus::Unchanged);
    }

    #[tokio::test]
    async fn remote_authority_confirms_submissions() {
        let r = router(FakeRemote::new());
        r.reconcile().await.unwrap();
        assert_eq!(r.authority(), Authority::Remote);

        let outcome = r.submit(key(3), 66.0, 5_000).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Confirmed(ref rc) if rc.status == ReceiptStatus::Accepted));
        assert!(r.outbox().pending().unwrap().is_empty());
        assert_eq!(
            r.remote.ledger.get(&key(3)).unwrap().unwrap().mark.value(),
            66.0
        );
    }

    #[tokio::test]
    async fn timeout_is_unknown_and_falls_back() {
        let r = router(FakeRemote::new());
        r.reconcile().await.unwrap();
        r.remote.hang.store(true, Ordering::SeqCst);

        let outcome = r.submit(key(4), 90.0, 9_000).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Unknown);
        assert_eq!(r.authority(), Authority::Local);
        assert_eq!(r.outbox().pending().unwrap().len(), 1);
        assert_eq!(
            r.outbox().ledger().get(&key(4)).unwrap().unwrap().mark.value(),
            90.0
        );
    }

    #[tokio::test]
    async fn invalid_mark_never_recorded() {
        let r = router(FakeRemote::new());
        assert!(r.submit(key(5), 101.0, 1).await.is_err());
        assert!(r.outbox().pending().unwrap().is_empty());
    }

    #[test]
    fn receipts_must_match_batch() {
        let outbox = Outbox::new(
            OriginId::new("t"),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryAckStore::new()),
        )
        .unwrap();
        let s = outbox.record(key(1), Mark::new(70.0).unwrap(), 1).unwrap();
        let err = outbox.apply_receipts(&[s], &[]).unwrap_err();
        assert!(matches!(
            err,
            FeisError::Sync(SyncError::ReceiptMismatch { expected: 1, got: 0 })
        ));
    }
}
