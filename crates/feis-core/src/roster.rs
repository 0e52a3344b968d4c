//! Rounds, entries, and presence supplied by registration and check-in.
//!
//! The roster is loaded once from JSON at node start. Presence is the only
//! part that changes while a feis is running; each change bumps the round's
//! roster revision so cached results are recomputed. A [`RosterArchive`]
//! keeps those changes across restarts.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FeisError, RosterError};
use crate::traits::RosterSource;
use crate::types::{
    CompetitionId, CompetitionSpec, CompetitorId, Dance, JudgeId, Presence, RoundId, RoundSpec,
};

/// On-disk roster layout.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RosterFile {
    #[serde(default)]
    pub competitions: Vec<CompetitionSpec>,
    #[serde(default)]
    pub rounds: Vec<RoundFile>,
}

/// One round and its entrants as written in a roster file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RoundFile {
    pub id: RoundId,
    pub competition: CompetitionId,
    pub sequence: u32,
    pub dance: Dance,
    pub judges: Vec<JudgeId>,
    #[serde(default)]
    pub entries: Vec<EntryFile>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EntryFile {
    pub competitor: CompetitorId,
    #[serde(default)]
    pub presence: Presence,
}

/// Check-in state of one round: every entrant's presence and the round's
/// roster revision.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RoundPresence {
    pub round: RoundId,
    pub revision: u64,
    pub presence: Vec<(CompetitorId, Presence)>,
}

/// Durable home for check-in changes made while the roster is live.
pub trait RosterArchive: Send + Sync {
    fn save_presence(&self, state: &RoundPresence) -> Result<(), FeisError>;
    fn load_presence(&self) -> Result<Vec<RoundPresence>, FeisError>;
}

#[derive(Default)]
struct RosterData {
    competitions: BTreeMap<CompetitionId, CompetitionSpec>,
    rounds: BTreeMap<RoundId, RoundSpec>,
    entries: BTreeMap<RoundId, BTreeMap<CompetitorId, Presence>>,
    revisions: BTreeMap<RoundId, u64>,
}

impl RosterData {
    fn bump(&mut self, round: RoundId) -> u64 {
        let rev = self.revisions.entry(round).or_default();
        *rev += 1;
        *rev
    }
}

/// In-memory [`RosterSource`].
#[derive(Default)]
pub struct Roster {
    inner: RwLock<RosterData>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from its file layout, validating every round.
    pub fn from_file(file: RosterFile) -> Result<Self, RosterError> {
        let roster = Self::new();
        for competition in file.competitions {
            roster.add_competition(competition)?;
        }
        for round in file.rounds {
            let spec = RoundSpec {
                id: round.id,
                competition: round.competition,
                sequence: round.sequence,
                dance: round.dance,
                judges: round.judges,
            };
            let id = spec.id;
            roster.add_round(spec)?;
            for entry in round.entries {
                roster.enter(id, entry.competitor, entry.presence)?;
            }
        }
        Ok(roster)
    }

    pub fn from_json(json: &str) -> Result<Self, RosterError> {
        let file: RosterFile =
            serde_json::from_str(json).map_err(|e| RosterError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    /// Load a JSON roster file.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| RosterError::Parse(format!("{}: {e}", path.display())))?;
        let roster = Self::from_json(&json)?;
        let data = roster.inner.read();
        info!(
            path = %path.display(),
            competitions = data.competitions.len(),
            rounds = data.rounds.len(),
            "roster loaded"
        );
        drop(data);
        Ok(roster)
    }

    pub fn add_competition(&self, spec: CompetitionSpec) -> Result<(), RosterError> {
        let mut data = self.inner.write();
        if data.competitions.contains_key(&spec.id) {
            return Err(RosterError::DuplicateCompetition(spec.id));
        }
        data.competitions.insert(spec.id, spec);
        Ok(())
    }

    /// Add a round. Its competition must exist, its panel must hold 1, 3, or
    /// 5 distinct judges, and its sequence must be unique in the competition.
    pub fn add_round(&self, spec: RoundSpec) -> Result<(), RosterError> {
        spec.panel_size()?;
        for (i, judge) in spec.judges.iter().enumerate() {
            if spec.judges[..i].contains(judge) {
                return Err(RosterError::DuplicateJudge {
                    round: spec.id,
                    judge: *judge,
                });
            }
        }

        let mut data = self.inner.write();
        if !data.competitions.contains_key(&spec.competition) {
            return Err(RosterError::UnknownCompetition(spec.competition));
        }
        if data.rounds.contains_key(&spec.id) {
            return Err(RosterError::DuplicateRound(spec.id));
        }
        if data
            .rounds
            .values()
            .any(|r| r.competition == spec.competition && r.sequence == spec.sequence)
        {
            return Err(RosterError::DuplicateSequence {
                competition: spec.competition,
                sequence: spec.sequence,
            });
        }
        data.entries.entry(spec.id).or_default();
        data.revisions.entry(spec.id).or_insert(0);
        data.rounds.insert(spec.id, spec);
        Ok(())
    }

    /// Enter a competitor in a round. Re-entering only updates presence.
    pub fn enter(
        &self,
        round: RoundId,
        competitor: CompetitorId,
        presence: Presence,
    ) -> Result<u64, RosterError> {
        let mut data = self.inner.write();
        let entries = data
            .entries
            .get_mut(&round)
            .ok_or(RosterError::UnknownRound(round))?;
        entries.insert(competitor, presence);
        Ok(data.bump(round))
    }

    /// Change an entered competitor's presence. Returns the new roster
    /// revision of the round.
    pub fn set_presence(
        &self,
        round: RoundId,
        competitor: CompetitorId,
        presence: Presence,
    ) -> Result<u64, RosterError> {
        let mut data = self.inner.write();
        let entries = data
            .entries
            .get_mut(&round)
            .ok_or(RosterError::UnknownRound(round))?;
        let slot = entries
            .get_mut(&competitor)
            .ok_or(RosterError::NotEntered { round, competitor })?;
        if *slot == presence {
            return Ok(data.revisions.get(&round).copied().unwrap_or(0));
        }
        *slot = presence;
        let rev = data.bump(round);
        info!(%round, %competitor, ?presence, revision = rev, "presence changed");
        Ok(rev)
    }

    /// Current check-in state of a round.
    pub fn round_presence(&self, round: RoundId) -> Result<RoundPresence, RosterError> {
        let data = self.inner.read();
        let entries = data
            .entries
            .get(&round)
            .ok_or(RosterError::UnknownRound(round))?;
        Ok(RoundPresence {
            round,
            revision: data.revisions.get(&round).copied().unwrap_or(0),
            presence: entries.iter().map(|(c, p)| (*c, *p)).collect(),
        })
    }

    /// Reapply saved check-in state on top of the loaded file. Competitors
    /// no longer entered are skipped, and the round's roster revision never
    /// goes below the saved one. Returns how many entries changed.
    pub fn restore_presence(&self, saved: &RoundPresence) -> Result<usize, RosterError> {
        let mut data = self.inner.write();
        let entries = data
            .entries
            .get_mut(&saved.round)
            .ok_or(RosterError::UnknownRound(saved.round))?;
        let mut changed = 0;
        for (competitor, presence) in &saved.presence {
            match entries.get_mut(competitor) {
                Some(slot) if *slot != *presence => {
                    *slot = *presence;
                    changed += 1;
                }
                Some(_) => {}
                None => {
                    warn!(round = %saved.round, %competitor, "saved presence for unentered competitor")
                }
            }
        }
        let revision = data.revisions.entry(saved.round).or_default();
        *revision = (*revision).max(saved.revision);
        Ok(changed)
    }

    /// Restore every round saved in `archive`. Rounds missing from the
    /// roster are skipped with a warning.
    pub fn restore_from(&self, archive: &dyn RosterArchive) -> Result<(), FeisError> {
        let mut changed = 0;
        for saved in archive.load_presence()? {
            match self.restore_presence(&saved) {
                Ok(n) => changed += n,
                Err(e) => warn!(round = %saved.round, error = %e, "saved presence skipped"),
            }
        }
        if changed > 0 {
            info!(changed, "check-in changes restored");
        }
        Ok(())
    }

    /// Every round id, ascending.
    pub fn rounds(&self) -> Vec<RoundId> {
        self.inner.read().rounds.keys().copied().collect()
    }

    pub fn competitions(&self) -> Vec<CompetitionId> {
        self.inner.read().competitions.keys().copied().collect()
    }
}

impl RosterSource for Roster {
    fn competition(&self, id: CompetitionId) -> Result<CompetitionSpec, RosterError> {
        self.inner
            .read()
            .competitions
            .get(&id)
            .cloned()
            .ok_or(RosterError::UnknownCompetition(id))
    }

    fn round(&self, id: RoundId) -> Result<RoundSpec, RosterError> {
        self.inner
            .read()
            .rounds
            .get(&id)
            .cloned()
            .ok_or(RosterError::UnknownRound(id))
    }

    fn competition_rounds(&self, id: CompetitionId) -> Result<Vec<RoundSpec>, RosterError> {
        let data = self.inner.read();
        if !data.competitions.contains_key(&id) {
            return Err(RosterError::UnknownCompetition(id));
        }
        let mut rounds: Vec<RoundSpec> = data
            .rounds
            .values()
            .filter(|r| r.competition == id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.sequence);
        Ok(rounds)
    }

    fn entries(&self, round: RoundId) -> Result<BTreeMap<CompetitorId, Presence>, RosterError> {
        self.inner
            .read()
            .entries
            .get(&round)
            .cloned()
            .ok_or(RosterError::UnknownRound(round))
    }

    fn roster_revision(&self, round: RoundId) -> Result<u64, RosterError> {
        self.inner
            .read()
            .revisions
            .get(&round)
            .copied()
            .ok_or(RosterError::UnknownRound(round))
    }
}
