//! Client-side subscription state machine.
//!
//! Drives a viewer (judge tablet, stage display) through
//! `Disconnected -> Connected -> Subscribed`. The manager performs no I/O;
//! every event returns a [`SessionAction`] for the caller to carry out.
//! The held view is dropped on disconnect so a reconnecting client only
//! ever shows state that came from a fresh snapshot.

use tracing::{debug, info, warn};

use feis_core::types::RoundId;
use feis_tabulate::results::RoundResults;

use crate::protocol::{MessageKind, ResultsMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Subscribed { round: RoundId },
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open (or reopen) the connection.
    Connect,
    /// Send a subscription request for the round.
    Subscribe(RoundId),
    /// Drop the current subscription and subscribe again for a snapshot.
    Resubscribe(RoundId),
    /// The view was replaced; render it.
    Render,
    /// Nothing to do for this event.
    Ignore,
}

/// Subscription state for one watched round.
#[derive(Debug)]
pub struct SessionManager {
    state: SessionState,
    round: RoundId,
    view: Option<RoundResults>,
    reconnects: u32,
}

impl SessionManager {
    pub fn new(round: RoundId) -> Self {
        Self {
            state: SessionState::Disconnected,
            round,
            view: None,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Latest results held, if any.
    pub fn view(&self) -> Option<&RoundResults> {
        self.view.as_ref()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn on_connected(&mut self) -> SessionAction {
        debug!(round = %self.round, "session connected");
        self.state = SessionState::Connected;
        SessionAction::Subscribe(self.round)
    }

    pub fn on_subscribed(&mut self) -> SessionAction {
        self.state = SessionState::Subscribed { round: self.round };
        SessionAction::Ignore
    }

    /// Connection or subscription lost.
    pub fn on_disconnected(&mut self) -> SessionAction {
        if self.state != SessionState::Disconnected {
            self.reconnects += 1;
            info!(round = %self.round, reconnects = self.reconnects, "session disconnected");
        }
        self.state = SessionState::Disconnected;
        self.view = None;
        SessionAction::Connect
    }

    /// Switch to another round; the current view is discarded.
    pub fn watch(&mut self, round: RoundId) -> SessionAction {
        self.round = round;
        self.view = None;
        match self.state {
            SessionState::Disconnected => SessionAction::Connect,
            _ => {
                self.state = SessionState::Connected;
                SessionAction::Resubscribe(round)
            }
        }
    }

    pub fn on_message(&mut self, msg: ResultsMessage) -> SessionAction {
        let SessionState::Subscribed { round } = self.state else {
            return SessionAction::Ignore;
        };
        if msg.results.round != round {
            return SessionAction::Ignore;
        }

        let held = self.view.as_ref().map(|v| v.revision);
        match (msg.kind, held) {
            (MessageKind::Snapshot, _) => {
                self.view = Some(msg.results);
                SessionAction::Render
            }
            (MessageKind::Changed, None) => {
                // Increment with no base snapshot: start over.
                warn!(%round, revision = msg.results.revision, "change before snapshot, resubscribing");
                self.state = SessionState::Connected;
                SessionAction::Resubscribe(round)
            }
            (MessageKind::Changed, Some(held)) if msg.results.revision <= held => {
                SessionAction::Ignore
            }
            (MessageKind::Changed, Some(_)) => {
                self.view = Some(msg.results);
                SessionAction::Render
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feis_core::types::{CompetitionId, PanelSize};

    fn results(round: u64, revision: u64) -> RoundResults {
        RoundResults {
            round: RoundId(round),
            competition: CompetitionId(1),
            revision,
            rows: Vec::new(),
            judge_count: 0,
            panel_size: PanelSize::One,
            panel_complete: false,
        }
    }

    fn subscribed() -> SessionManager {
        let mut s = SessionManager::new(RoundId(1));
        assert_eq!(s.on_connected(), SessionAction::Subscribe(RoundId(1)));
        s.on_subscribed();
        s
    }

    #[test]
    fn snapshot_then_changes() {
        let mut s = subscribed();
        assert_eq!(
            s.on_message(ResultsMessage::snapshot(results(1, 3))),
            SessionAction::Render
        );
        assert_eq!(
            s.on_message(ResultsMessage::changed(results(1, 2))),
            SessionAction::Ignore
        );
        assert_eq!(
            s.on_message(ResultsMessage::changed(results(1, 4))),
            SessionAction::Render
        );
        assert_eq!(s.view().unwrap().revision, 4);
    }

    #[test]
    fn change_without_snapshot_resubscribes() {
        let mut s = subscribed();
        assert_eq!(
            s.on_message(ResultsMessage::changed(results(1, 2))),
            SessionAction::Resubscribe(RoundId(1))
        );
        assert_eq!(s.state(), &SessionState::Connected);
    }

    #[test]
    fn disconnect_discards_view() {
        let mut s = subscribed();
        s.on_message(ResultsMessage::snapshot(results(1, 3)));
        assert_eq!(s.on_disconnected(), SessionAction::Connect);
        assert!(s.view().is_none());
        assert_eq!(s.reconnects(), 1);

        // Messages before resubscription are dropped.
        assert_eq!(
            s.on_message(ResultsMessage::snapshot(results(1, 9))),
            SessionAction::Ignore
        );
    }

    #[test]
    fn other_round_ignored() {
        let mut s = subscribed();
        assert_eq!(
            s.on_message(ResultsMessage::snapshot(results(2, 1))),
            SessionAction::Ignore
        );
    }

    #[test]
    fn watch_switches_round() {
        let mut s = subscribed();
        s.on_message(ResultsMessage::snapshot(results(1, 1)));
        assert_eq!(s.watch(RoundId(2)), SessionAction::Resubscribe(RoundId(2)));
        assert!(s.view().is_none());
    }
}
