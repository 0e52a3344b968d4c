//! RocksDB-backed persistent score ledger.
//!
//! Implements [`ScoreLedger`] (and the device-side [`AckStore`]) using
//! RocksDB column families for cells, per-round revisions, the audit trail,
//! open conflicts, the outbox, published recalls, and check-in changes. Every effective change
//! commits its cell, the round revision, and any audit row in one atomic
//! [`WriteBatch`] under a per-round lock; reads go through a RocksDB
//! snapshot, so a round snapshot never mixes two revisions.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, SliceTransform, WriteBatch,
};
use tracing::{debug, info, warn};

use feis_core::error::FeisError;
use feis_core::ledger::{CellChange, plan_correction, plan_resolution};
use feis_core::merge::{self, MergeDecision};
use feis_core::roster::{RosterArchive, RoundPresence};
use feis_core::traits::ScoreLedger;
use feis_core::types::{
    CompetitionId, CompetitorId, ConflictResolution, Correction, CorrectionRecord, JudgeId,
    MergeOutcome, MergePolicy, RoundId, RoundSnapshot, Score, ScoreKey, SyncConflict, TimestampMs,
    UpsertOutcome, now_ms,
};
use feis_sync::outbox::AckStore;

use crate::recall_store::{PublishedRecall, RecallArchive};

// --- Column family names ---

const CF_SCORES: &str = "scores";
const CF_REVISIONS: &str = "revisions";
const CF_CORRECTIONS: &str = "corrections";
const CF_CONFLICTS: &str = "conflicts";
const CF_OUTBOX: &str = "outbox";
const CF_RECALLS: &str = "recalls";
const CF_ROSTER: &str = "roster";
const CF_META: &str = "meta";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_SCORES,
    CF_REVISIONS,
    CF_CORRECTIONS,
    CF_CONFLICTS,
    CF_OUTBOX,
    CF_RECALLS,
    CF_ROSTER,
    CF_META,
];

/// Families keyed by round first; scanned by round prefix.
const ROUND_PREFIXED: &[&str] = &[CF_SCORES, CF_CORRECTIONS, CF_CONFLICTS];

// --- Metadata keys ---

const META_LAST_SEQUENCE: &[u8] = b"last_sequence";

const ROUND_PREFIX_LEN: usize = 8;
const CELL_KEY_LEN: usize = 24;

fn storage_err(e: impl std::fmt::Display) -> FeisError {
    FeisError::Storage(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, FeisError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(storage_err)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, FeisError> {
    let (value, _) =
        bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(storage_err)?;
    Ok(value)
}

/// Decode a stored cell and re-check its mark.
fn decode_score(bytes: &[u8]) -> Result<Score, FeisError> {
    let score: Score = decode(bytes)?;
    score.mark.validate()?;
    Ok(score)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, FeisError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| FeisError::Storage(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn round_prefix(round: RoundId) -> [u8; ROUND_PREFIX_LEN] {
    round.0.to_be_bytes()
}

/// `round || competitor || judge`, big-endian so cells sort by competitor.
fn cell_key(key: &ScoreKey) -> [u8; CELL_KEY_LEN] {
    let mut out = [0u8; CELL_KEY_LEN];
    out[..8].copy_from_slice(&key.round.0.to_be_bytes());
    out[8..16].copy_from_slice(&key.competitor.0.to_be_bytes());
    out[16..].copy_from_slice(&key.judge.0.to_be_bytes());
    out
}

fn decode_cell_key(bytes: &[u8]) -> Result<ScoreKey, FeisError> {
    if bytes.len() != CELL_KEY_LEN {
        return Err(FeisError::Storage(format!(
            "cell key of {} bytes",
            bytes.len()
        )));
    }
    Ok(ScoreKey::new(
        RoundId(decode_u64(&bytes[..8])?),
        CompetitorId(decode_u64(&bytes[8..16])?),
        JudgeId(decode_u64(&bytes[16..])?),
    ))
}

/// `round || revision`: one audit row per revision, oldest first.
fn correction_key(round: RoundId, revision: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&round.0.to_be_bytes());
    out[8..].copy_from_slice(&revision.to_be_bytes());
    out
}

fn recall_key(competition: CompetitionId, through_round: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&competition.0.to_be_bytes());
    out[8..].copy_from_slice(&through_round.to_be_bytes());
    out
}

/// RocksDB-backed [`ScoreLedger`].
pub struct RocksLedger {
    db: DB,
    /// Serializes read-modify-write cycles within one round.
    round_locks: DashMap<RoundId, Arc<Mutex<()>>>,
    outbox_lock: Mutex<()>,
}

impl RocksLedger {
    /// Open or create a ledger database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FeisError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                if ROUND_PREFIXED.contains(name) {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(
                        ROUND_PREFIX_LEN,
                    ));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;
        info!(path = %path.as_ref().display(), "ledger opened");

        Ok(Self {
            db,
            round_locks: DashMap::new(),
            outbox_lock: Mutex::new(()),
        })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), FeisError> {
        self.db.flush().map_err(storage_err)
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, FeisError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| FeisError::Storage(format!("missing column family: {name}")))
    }

    fn round_lock(&self, round: RoundId) -> Arc<Mutex<()>> {
        self.round_locks
            .entry(round)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_cell(&self, key: &ScoreKey) -> Result<Option<Score>, FeisError> {
        let cf = self.cf_handle(CF_SCORES)?;
        match self.db.get_cf(cf, cell_key(key)).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode_score(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_revision(&self, round: RoundId) -> Result<u64, FeisError> {
        let cf = self.cf_handle(CF_REVISIONS)?;
        match self.db.get_cf(cf, round_prefix(round)).map_err(storage_err)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn read_conflicts(&self, key: &ScoreKey) -> Result<Vec<SyncConflict>, FeisError> {
        let cf = self.cf_handle(CF_CONFLICTS)?;
        match self.db.get_cf(cf, cell_key(key)).map_err(storage_err)? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Every value stored under `round`'s prefix in `cf_name`, in key order.
    fn scan_round(
        &self,
        cf_name: &str,
        round: RoundId,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, FeisError> {
        let cf = self.cf_handle(cf_name)?;
        let prefix = round_prefix(round);
        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// Stage a cell write plus revision bump. Returns the new revision.
    fn stage_cell(
        &self,
        batch: &mut WriteBatch,
        key: &ScoreKey,
        value: Option<&Score>,
    ) -> Result<u64, FeisError> {
        let cf_scores = self.cf_handle(CF_SCORES)?;
        let cf_rev = self.cf_handle(CF_REVISIONS)?;
        match value {
            Some(score) => batch.put_cf(cf_scores, cell_key(key), encode(score)?),
            None => batch.delete_cf(cf_scores, cell_key(key)),
        }
        let revision = self.read_revision(key.round)? + 1;
        batch.put_cf(cf_rev, round_prefix(key.round), revision.to_be_bytes());
        Ok(revision)
    }

    /// Commit a planned correction or resolution with its audit row.
    fn apply_change(
        &self,
        key: &ScoreKey,
        change: CellChange,
        clear_conflicts: bool,
    ) -> Result<CorrectionRecord, FeisError> {
        let mut batch = WriteBatch::default();
        let revision = self.stage_cell(&mut batch, key, change.value.as_ref())?;
        let record = CorrectionRecord {
            revision,
            ..change.record
        };
        let cf_corr = self.cf_handle(CF_CORRECTIONS)?;
        batch.put_cf(cf_corr, correction_key(key.round, revision), encode(&record)?);
        if clear_conflicts {
            let cf_conf = self.cf_handle(CF_CONFLICTS)?;
            batch.delete_cf(cf_conf, cell_key(key));
        }
        self.db.write(batch).map_err(storage_err)?;
        Ok(record)
    }
}

impl ScoreLedger for RocksLedger {
    fn upsert(&self, score: Score) -> Result<UpsertOutcome, FeisError> {
        score.mark.validate()?;
        let key = score.key;
        let lock = self.round_lock(key.round);
        let _guard = lock.lock();

        let outcome = match self.read_cell(&key)? {
            Some(existing) if existing.mark == score.mark => UpsertOutcome::Unchanged,
            Some(existing) => UpsertOutcome::Replaced {
                previous: existing.mark,
            },
            None => UpsertOutcome::Inserted,
        };

        if outcome.changed() {
            let mut batch = WriteBatch::default();
            let revision = self.stage_cell(&mut batch, &key, Some(&score))?;
            self.db.write(batch).map_err(storage_err)?;
            debug!(%key, revision, "upserted score");
        }
        Ok(outcome)
    }

    fn merge(&self, score: Score, policy: &MergePolicy) -> Result<MergeOutcome, FeisError> {
        score.mark.validate()?;
        let key = score.key;
        let lock = self.round_lock(key.round);
        let _guard = lock.lock();
        let current = self.read_cell(&key)?;

        match merge::decide(current.as_ref(), &score, policy) {
            MergeDecision::Apply => {
                let mut batch = WriteBatch::default();
                let revision = self.stage_cell(&mut batch, &key, Some(&score))?;
                self.db.write(batch).map_err(storage_err)?;
                debug!(%key, revision, "merged score");
                Ok(MergeOutcome::Applied)
            }
            MergeDecision::Unchanged => Ok(MergeOutcome::Unchanged),
            MergeDecision::Stale => Ok(MergeOutcome::Stale),
            MergeDecision::Conflict => {
                let current = current
                    .ok_or_else(|| FeisError::Storage(format!("conflict on empty cell {key}")))?;
                let mut open = self.read_conflicts(&key)?;
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
                let cf = self.cf_handle(CF_CONFLICTS)?;
                self.db
                    .put_cf(cf, cell_key(&key), encode(&open)?)
                    .map_err(storage_err)?;
                Ok(MergeOutcome::Conflict(conflict))
            }
        }
    }

    fn get(&self, key: &ScoreKey) -> Result<Option<Score>, FeisError> {
        self.read_cell(key)
    }

    fn snapshot(&self, round: RoundId) -> Result<RoundSnapshot, FeisError> {
        let cf_scores = self.cf_handle(CF_SCORES)?;
        let cf_rev = self.cf_handle(CF_REVISIONS)?;
        let prefix = round_prefix(round);
        let snap = self.db.snapshot();

        let revision = match snap.get_cf(cf_rev, prefix).map_err(storage_err)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 0,
        };
        let mut scores = Vec::new();
        for item in snap.iterator_cf(cf_scores, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            scores.push(decode_score(&value)?);
        }
        Ok(RoundSnapshot {
            round,
            revision,
            scores,
        })
    }

    fn revision(&self, round: RoundId) -> Result<u64, FeisError> {
        self.read_revision(round)
    }

    fn rounds(&self) -> Result<Vec<RoundId>, FeisError> {
        let cf = self.cf_handle(CF_REVISIONS)?;
        let mut rounds = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(storage_err)?;
            rounds.push(RoundId(decode_u64(&key)?));
        }
        Ok(rounds)
    }

    fn correct(&self, correction: Correction) -> Result<CorrectionRecord, FeisError> {
        let key = correction.key;
        let lock = self.round_lock(key.round);
        let _guard = lock.lock();

        let current = self.read_cell(&key)?;
        let change = plan_correction(current.as_ref(), &correction)?;
        let removed = change.value.is_none();
        let record = self.apply_change(&key, change, removed)?;
        info!(%key, actor = %record.actor, reason = %record.reason, "administrative correction");
        Ok(record)
    }

    fn corrections(&self, round: RoundId) -> Result<Vec<CorrectionRecord>, FeisError> {
        self.scan_round(CF_CORRECTIONS, round)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn conflicts(&self, round: RoundId) -> Result<Vec<SyncConflict>, FeisError> {
        let mut out = Vec::new();
        for (_, value) in self.scan_round(CF_CONFLICTS, round)? {
            out.extend(decode::<Vec<SyncConflict>>(&value)?);
        }
        Ok(out)
    }

    fn resolve_conflict(
        &self,
        key: &ScoreKey,
        resolution: ConflictResolution,
        actor: &str,
        reason: &str,
        at_ms: TimestampMs,
    ) -> Result<CorrectionRecord, FeisError> {
        let lock = self.round_lock(key.round);
        let _guard = lock.lock();

        let current = self.read_cell(key)?;
        let open = self.read_conflicts(key)?;
        let change =
            plan_resolution(key, current.as_ref(), &open, &resolution, actor, reason, at_ms)?;
        let record = self.apply_change(key, change, true)?;
        info!(
            %key,
            actor,
            reason,
            settled = open.len(),
            value = ?record.new.map(|m| m.value()),
            "sync conflict resolved"
        );
        Ok(record)
    }
}

impl AckStore for RocksLedger {
    fn mark_pending(&self, key: ScoreKey, sequence: u64) -> Result<(), FeisError> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let _guard = self.outbox_lock.lock();
        self.db
            .put_cf(cf, cell_key(&key), sequence.to_be_bytes())
            .map_err(storage_err)
    }

    fn acknowledge(&self, key: &ScoreKey, sequence: u64) -> Result<bool, FeisError> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let _guard = self.outbox_lock.lock();
        let Some(bytes) = self.db.get_cf(cf, cell_key(key)).map_err(storage_err)? else {
            return Ok(false);
        };
        // A newer local write is still unconfirmed.
        if decode_u64(&bytes)? > sequence {
            return Ok(false);
        }
        self.db.delete_cf(cf, cell_key(key)).map_err(storage_err)?;
        Ok(true)
    }

    fn pending_keys(&self) -> Result<Vec<(ScoreKey, u64)>, FeisError> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            out.push((decode_cell_key(&key)?, decode_u64(&value)?));
        }
        Ok(out)
    }

    fn last_sequence(&self) -> Result<u64, FeisError> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_LAST_SEQUENCE).map_err(storage_err)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn set_last_sequence(&self, sequence: u64) -> Result<(), FeisError> {
        let cf = self.cf_handle(CF_META)?;
        self.db
            .put_cf(cf, META_LAST_SEQUENCE, sequence.to_be_bytes())
            .map_err(storage_err)
    }
}

impl RecallArchive for RocksLedger {
    fn save_recall(&self, recall: &PublishedRecall) -> Result<(), FeisError> {
        let cf = self.cf_handle(CF_RECALLS)?;
        let key = recall_key(recall.sheet.competition, recall.sheet.through_round);
        self.db.put_cf(cf, key, encode(recall)?).map_err(storage_err)
    }

    fn remove_recall(&self, competition: CompetitionId, through_round: u32) -> Result<(), FeisError> {
        let cf = self.cf_handle(CF_RECALLS)?;
        self.db
            .delete_cf(cf, recall_key(competition, through_round))
            .map_err(storage_err)
    }

    fn load_recalls(&self) -> Result<Vec<PublishedRecall>, FeisError> {
        let cf = self.cf_handle(CF_RECALLS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(storage_err)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

impl RosterArchive for RocksLedger {
    fn save_presence(&self, state: &RoundPresence) -> Result<(), FeisError> {
        let cf = self.cf_handle(CF_ROSTER)?;
        self.db
            .put_cf(cf, round_prefix(state.round), encode(state)?)
            .map_err(storage_err)
    }

    fn load_presence(&self) -> Result<Vec<RoundPresence>, FeisError> {
        let cf = self.cf_handle(CF_ROSTER)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(storage_err)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}
