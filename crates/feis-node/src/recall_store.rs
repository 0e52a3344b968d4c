//! Published recall decisions.
//!
//! A recall sheet is recomputed on every request. Publishing freezes the
//! current sheet; later requests return the frozen sheet and flag it stale
//! once any input round's results revision moves on. Reopening removes the
//! frozen sheet and is logged with who did it and why.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use feis_core::error::{FeisError, LedgerError, RecallError};
use feis_core::types::{CompetitionId, TimestampMs};
use feis_sync::protocol::RecallView;
use feis_tabulate::recall::RecallSheet;

/// A frozen recall sheet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PublishedRecall {
    pub sheet: RecallSheet,
    pub actor: String,
    pub published_at_ms: TimestampMs,
}

/// Durable home for published recalls.
pub trait RecallArchive: Send + Sync {
    fn save_recall(&self, recall: &PublishedRecall) -> Result<(), FeisError>;
    fn remove_recall(&self, competition: CompetitionId, through_round: u32) -> Result<(), FeisError>;
    fn load_recalls(&self) -> Result<Vec<PublishedRecall>, FeisError>;
}

type RecallKey = (CompetitionId, u32);

pub struct RecallStore {
    published: RwLock<BTreeMap<RecallKey, PublishedRecall>>,
    archive: Option<Arc<dyn RecallArchive>>,
}

impl RecallStore {
    pub fn in_memory() -> Self {
        Self {
            published: RwLock::new(BTreeMap::new()),
            archive: None,
        }
    }

    /// Load previously published recalls from `archive` and write through
    /// to it from now on.
    pub fn with_archive(archive: Arc<dyn RecallArchive>) -> Result<Self, FeisError> {
        let published: BTreeMap<RecallKey, PublishedRecall> = archive
            .load_recalls()?
            .into_iter()
            .map(|r| ((r.sheet.competition, r.sheet.through_round), r))
            .collect();
        if !published.is_empty() {
            info!(count = published.len(), "published recalls loaded");
        }
        Ok(Self {
            published: RwLock::new(published),
            archive: Some(archive),
        })
    }

    pub fn get(&self, competition: CompetitionId, through_round: u32) -> Option<PublishedRecall> {
        self.published
            .read()
            .get(&(competition, through_round))
            .cloned()
    }

    /// Freeze `sheet`.
    ///
    /// # Errors
    ///
    /// - [`RecallError::Provisional`] if any input round is incomplete
    /// - [`RecallError::AlreadyPublished`] if this recall is already frozen
    pub fn publish(
        &self,
        sheet: RecallSheet,
        actor: &str,
        at_ms: TimestampMs,
    ) -> Result<PublishedRecall, FeisError> {
        if actor.trim().is_empty() {
            return Err(LedgerError::MissingAuditTrail.into());
        }
        let key = (sheet.competition, sheet.through_round);
        if sheet.provisional {
            return Err(RecallError::Provisional {
                competition: key.0,
                through_round: key.1,
            }
            .into());
        }

        let mut published = self.published.write();
        if published.contains_key(&key) {
            return Err(RecallError::AlreadyPublished {
                competition: key.0,
                through_round: key.1,
            }
            .into());
        }
        let recall = PublishedRecall {
            sheet,
            actor: actor.to_string(),
            published_at_ms: at_ms,
        };
        if let Some(archive) = &self.archive {
            archive.save_recall(&recall)?;
        }
        info!(
            competition = %key.0,
            through_round = key.1,
            recalled = recall.sheet.recalled_count,
            actor,
            "recall published"
        );
        published.insert(key, recall.clone());
        Ok(recall)
    }

    /// Unfreeze a published recall. Returns what was published.
    pub fn reopen(
        &self,
        competition: CompetitionId,
        through_round: u32,
        actor: &str,
        reason: &str,
    ) -> Result<PublishedRecall, FeisError> {
        if actor.trim().is_empty() || reason.trim().is_empty() {
            return Err(LedgerError::MissingAuditTrail.into());
        }
        let mut published = self.published.write();
        let Some(recall) = published.remove(&(competition, through_round)) else {
            return Err(RecallError::NotPublished {
                competition,
                through_round,
            }
            .into());
        };
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.remove_recall(competition, through_round) {
                published.insert((competition, through_round), recall);
                return Err(e);
            }
        }
        warn!(%competition, through_round, actor, reason, "published recall reopened");
        Ok(recall)
    }

    /// Publication view over a freshly computed sheet.
    pub fn view(&self, current: RecallSheet) -> RecallView {
        match self.get(current.competition, current.through_round) {
            Some(frozen) => RecallView {
                stale: frozen.sheet.input_revisions != current.input_revisions,
                sheet: frozen.sheet,
                published: true,
                published_at_ms: Some(frozen.published_at_ms),
            },
            None => RecallView {
                sheet: current,
                published: false,
                published_at_ms: None,
                stale: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feis_core::types::RoundId;

    fn sheet(provisional: bool, revision: u64) -> RecallSheet {
        RecallSheet {
            competition: CompetitionId(7),
            through_round: 2,
            percent: 50,
            entries: Vec::new(),
            recalled_count: 0,
            cut_index: 0,
            provisional,
            input_revisions: [(RoundId(1), 4), (RoundId(2), revision)].into_iter().collect(),
        }
    }

    #[test]
    fn unpublished_view_is_fresh() {
        let store = RecallStore::in_memory();
        let view = store.view(sheet(true, 1));
        assert!(!view.published);
        assert!(!view.stale);
        assert!(view.sheet.provisional);
    }

    #[test]
    fn provisional_sheet_cannot_be_published() {
        let store = RecallStore::in_memory();
        let err = store.publish(sheet(true, 1), "tab", 10).unwrap_err();
        assert!(matches!(err, FeisError::Recall(RecallError::Provisional { .. })));
    }

    #[test]
    fn published_view_goes_stale_on_revision_change() {
        let store = RecallStore::in_memory();
        store.publish(sheet(false, 3), "tab", 10).unwrap();

        let same = store.view(sheet(false, 3));
        assert!(same.published);
        assert!(!same.stale);
        assert_eq!(same.published_at_ms, Some(10));

        let moved = store.view(sheet(false, 5));
        assert!(moved.stale);
        assert_eq!(moved.sheet.input_revisions[&RoundId(2)], 3);
    }

    #[test]
    fn publish_twice_rejected_until_reopened() {
        let store = RecallStore::in_memory();
        store.publish(sheet(false, 3), "tab", 10).unwrap();
        assert!(matches!(
            store.publish(sheet(false, 3), "tab", 11).unwrap_err(),
            FeisError::Recall(RecallError::AlreadyPublished { .. })
        ));

        assert!(store.reopen(CompetitionId(7), 2, "tab", "").is_err());
        store.reopen(CompetitionId(7), 2, "tab", "score correction").unwrap();
        assert!(store.get(CompetitionId(7), 2).is_none());
        store.publish(sheet(false, 4), "tab", 12).unwrap();
    }

    #[test]
    fn reopen_unpublished_rejected() {
        let store = RecallStore::in_memory();
        assert!(matches!(
            store.reopen(CompetitionId(7), 2, "tab", "why").unwrap_err(),
            FeisError::Recall(RecallError::NotPublished { .. })
        ));
    }
}
