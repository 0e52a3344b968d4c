//! Memoized round results.
//!
//! Results are a pure function of a round's ledger snapshot, its roster
//! state, and the node's tabulation settings. The settings are fixed for a
//! node, so an entry stays valid exactly as long as the round's combined
//! revision does.

use std::sync::Arc;

use dashmap::DashMap;

use feis_core::types::RoundId;
use feis_tabulate::results::RoundResults;

#[derive(Default)]
pub struct ResultsCache {
    rounds: DashMap<RoundId, Arc<RoundResults>>,
}

impl ResultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached results for `round` if they were computed at `revision`.
    pub fn get(&self, round: RoundId, revision: u64) -> Option<Arc<RoundResults>> {
        self.rounds
            .get(&round)
            .filter(|r| r.revision == revision)
            .map(|r| Arc::clone(r.value()))
    }

    /// Store `results` unless something newer is already cached.
    pub fn insert(&self, results: RoundResults) -> Arc<RoundResults> {
        let results = Arc::new(results);
        let mut entry = self
            .rounds
            .entry(results.round)
            .or_insert_with(|| Arc::clone(&results));
        if entry.revision < results.revision {
            *entry = Arc::clone(&results);
        }
        results
    }

    pub fn invalidate(&self, round: RoundId) {
        self.rounds.remove(&round);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
