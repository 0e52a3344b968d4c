//! Per-round fan-out of results to live subscribers.
//!
//! Each round has its own `tokio::sync::broadcast` channel carrying full
//! [`RoundResults`] replacements, so a subscriber never needs a message it
//! missed: the newest one is the whole state. A subscriber that falls
//! behind the channel buffer is resynchronized with a snapshot.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use feis_core::constants::DEFAULT_BROADCAST_CAPACITY;
use feis_core::types::RoundId;
use feis_tabulate::results::RoundResults;

use crate::protocol::ResultsMessage;

/// Fan-out hub keyed by round.
pub struct RoundBroadcaster {
    channels: DashMap<RoundId, broadcast::Sender<Arc<RoundResults>>>,
    capacity: usize,
}

impl RoundBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push new results to every subscriber of their round. Returns how
    /// many subscribers received them.
    pub fn publish(&self, results: RoundResults) -> usize {
        let round = results.round;
        let revision = results.revision;
        let Some(tx) = self.channels.get(&round).map(|s| s.value().clone()) else {
            return 0;
        };
        match tx.send(Arc::new(results)) {
            Ok(n) => {
                debug!(%round, revision, subscribers = n, "results broadcast");
                n
            }
            // Every receiver has gone away.
            Err(_) => 0,
        }
    }

    /// Subscribe to a round. Subscribe before reading the snapshot so no
    /// change between the two is lost.
    pub fn subscribe(&self, round: RoundId) -> broadcast::Receiver<Arc<RoundResults>> {
        self.channels
            .entry(round)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, round: RoundId) -> usize {
        self.channels
            .get(&round)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before - self.channels.len()
    }
}

impl Default for RoundBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

/// Turns one subscriber's stream of results into protocol messages:
/// a snapshot first, then only strictly newer revisions.
#[derive(Debug, Default)]
pub struct RoundFeed {
    last_revision: Option<u64>,
}

impl RoundFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial state (or state after the subscriber lagged).
    pub fn snapshot(&mut self, results: RoundResults) -> ResultsMessage {
        self.last_revision = Some(results.revision);
        ResultsMessage::snapshot(results)
    }

    /// A change, or `None` when it is not newer than what was last sent.
    pub fn changed(&mut self, results: &RoundResults) -> Option<ResultsMessage> {
        match self.last_revision {
            Some(last) if results.revision <= last => None,
            None => Some(self.snapshot(results.clone())),
            Some(_) => {
                self.last_revision = Some(results.revision);
                Some(ResultsMessage::changed(results.clone()))
            }
        }
    }

    pub fn last_revision(&self) -> Option<u64> {
        self.last_revision
    }
}
