//! Core domain types: identifiers, marks, scores, points, and round layout.
//!
//! Raw marks are validated once, at construction; a [`Mark`] that exists is
//! always finite and inside `[MARK_MIN, MARK_MAX]`. Converted points are
//! fixed-point integers so every device tabulates identical values.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::constants::{ADMIN_ORIGIN_PREFIX, MARK_MAX, MARK_MIN, POINTS_PRECISION, UNSEQUENCED};
use crate::error::{LedgerError, RosterError, TabulationError};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            Default, bincode::Encode, bincode::Decode,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// A competition (one age/level/dance grouping) containing one or more rounds.
    CompetitionId
);
id_type!(
    /// One judged round within a competition.
    RoundId
);
id_type!(
    /// An entrant. Opaque to the engine.
    CompetitorId
);
id_type!(
    /// An adjudicator on a round's panel.
    JudgeId
);

/// Device (or admin actor) that produced a score.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct OriginId(pub String);

impl OriginId {
    pub fn new(origin: impl Into<String>) -> Self {
        Self(origin.into())
    }

    /// Origin tag stamped on cells written through the correction path.
    pub fn admin(actor: &str) -> Self {
        Self(format!("{ADMIN_ORIGIN_PREFIX}{actor}"))
    }

    pub fn is_admin(&self) -> bool {
        self.0.starts_with(ADMIN_ORIGIN_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A raw adjudicator mark, validated to be finite and within range.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
#[serde(try_from = "f64", into = "f64")]
pub struct Mark(f64);

impl Mark {
    /// Validate a raw mark. Never clamps.
    pub fn new(value: f64) -> Result<Self, LedgerError> {
        if !value.is_finite() {
            return Err(LedgerError::MarkNotFinite);
        }
        if !(MARK_MIN..=MARK_MAX).contains(&value) {
            return Err(LedgerError::MarkOutOfRange {
                mark: value,
                min: MARK_MIN,
                max: MARK_MAX,
            });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Re-check the range invariant. Marks decoded from storage or the wire
    /// pass through here before entering a ledger.
    pub fn validate(&self) -> Result<(), LedgerError> {
        Self::new(self.0).map(|_| ())
    }
}

impl TryFrom<f64> for Mark {
    type Error = LedgerError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Mark> for f64 {
    fn from(mark: Mark) -> Self {
        mark.0
    }
}

impl PartialEq for Mark {
    fn eq(&self, other: &Self) -> bool {
        OrderedFloat(self.0) == OrderedFloat(other.0)
    }
}

impl Eq for Mark {}

impl PartialOrd for Mark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mark {
    fn cmp(&self, other: &Self) -> Ordering {
        OrderedFloat(self.0).cmp(&OrderedFloat(other.0))
    }
}

impl Hash for Mark {
    fn hash<H: Hasher>(&self, state: &mut H) {
        OrderedFloat(self.0).hash(state);
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Converted points in fixed-point micro-points.
///
/// Serialized as a decimal number of points (e.g. `70.0`); the conversion
/// back rounds to the nearest micro-point, so a value survives the wire
/// bit-for-bit.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
#[serde(try_from = "f64", into = "f64")]
pub struct Points(u64);

impl Points {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_whole(points: u64) -> Self {
        Self(points * POINTS_PRECISION)
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / POINTS_PRECISION as f64
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Sum an iterator of points, failing on overflow.
    pub fn sum<I: IntoIterator<Item = Points>>(iter: I) -> Result<Self, TabulationError> {
        iter.into_iter().try_fold(Self::ZERO, |acc, p| {
            acc.checked_add(p).ok_or(TabulationError::PointsOverflow)
        })
    }
}

impl TryFrom<f64> for Points {
    type Error = TabulationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(TabulationError::PointsOverflow);
        }
        let micros = (value * POINTS_PRECISION as f64).round();
        if micros > u64::MAX as f64 {
            return Err(TabulationError::PointsOverflow);
        }
        Ok(Self(micros as u64))
    }
}

impl From<Points> for f64 {
    fn from(points: Points) -> Self {
        points.as_f64()
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / POINTS_PRECISION;
        // Two decimals, rounded half-up.
        let hundredths = (self.0 % POINTS_PRECISION + POINTS_PRECISION / 200) / (POINTS_PRECISION / 100);
        if hundredths >= 100 {
            write!(f, "{}.00", whole + 1)
        } else {
            write!(f, "{whole}.{hundredths:02}")
        }
    }
}

/// Address of one ledger cell.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct ScoreKey {
    pub round: RoundId,
    pub competitor: CompetitorId,
    pub judge: JudgeId,
}

impl ScoreKey {
    pub fn new(round: RoundId, competitor: CompetitorId, judge: JudgeId) -> Self {
        Self {
            round,
            competitor,
            judge,
        }
    }
}

impl fmt::Display for ScoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}/c{}/j{}", self.round, self.competitor, self.judge)
    }
}

/// A raw mark stored in the ledger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Score {
    pub key: ScoreKey,
    pub mark: Mark,
    /// Submission time on the producing device.
    pub timestamp_ms: TimestampMs,
    /// Device that produced this value.
    pub origin: OriginId,
    /// Monotonic per-origin counter; orders writes from one device even
    /// when its clock is unreliable. [`UNSEQUENCED`] for live writes.
    pub sequence: u64,
}

impl Score {
    pub fn is_sequenced(&self) -> bool {
        self.sequence != UNSEQUENCED
    }

    /// Whether two scores carry the same value from the same write.
    pub fn same_write(&self, other: &Score) -> bool {
        self.key == other.key
            && self.mark == other.mark
            && self.origin == other.origin
            && self.sequence == other.sequence
            && self.timestamp_ms == other.timestamp_ms
    }
}

/// Consistent view of one round's cells.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RoundSnapshot {
    pub round: RoundId,
    /// Ledger revision of the round at the time of the snapshot.
    pub revision: u64,
    /// Cells ordered by `(competitor, judge)`.
    pub scores: Vec<Score>,
}

/// Result of an ordinary upsert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First value for this cell.
    Inserted,
    /// Overwrote a different value.
    Replaced { previous: Mark },
    /// Same mark as already stored; nothing changed.
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Reconciliation parameters.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergePolicy {
    /// Two origins whose timestamps for a cell differ by at most this many
    /// milliseconds cannot be ordered reliably.
    pub conflict_window_ms: u64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            conflict_window_ms: crate::constants::DEFAULT_CONFLICT_WINDOW_MS,
        }
    }
}

/// Competing values for one cell awaiting administrative review.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SyncConflict {
    pub key: ScoreKey,
    /// Value the ledger held (and keeps) when the conflict was detected.
    pub authoritative: Score,
    /// Incoming value that could not be ordered against it.
    pub contender: Score,
    pub detected_at_ms: TimestampMs,
}

/// Result of merging one reconciled score.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming value is now the cell value.
    Applied,
    /// Cell already holds this value.
    Unchanged,
    /// Incoming value is older than the cell value and was discarded.
    Stale,
    /// Ambiguous ordering; cell value kept, conflict recorded.
    Conflict(SyncConflict),
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A privileged overwrite (or removal, when `mark` is `None`) of one cell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Correction {
    pub key: ScoreKey,
    pub mark: Option<Mark>,
    pub actor: String,
    pub reason: String,
    pub timestamp_ms: TimestampMs,
}

/// Audit entry for a correction or a conflict resolution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CorrectionRecord {
    pub key: ScoreKey,
    pub previous: Option<Mark>,
    pub new: Option<Mark>,
    pub actor: String,
    pub reason: String,
    pub timestamp_ms: TimestampMs,
    /// Round revision after the correction was applied.
    pub revision: u64,
}

/// How an administrator settles a [`SyncConflict`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the value the ledger already holds.
    KeepAuthoritative,
    /// Take the contending value submitted by `origin`.
    AcceptContender { origin: OriginId },
    /// Replace the cell with an explicitly chosen mark.
    Override { mark: Mark },
}

/// Number of judges on a panel.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum PanelSize {
    One,
    Three,
    Five,
}

impl PanelSize {
    pub fn from_judges(count: usize) -> Result<Self, RosterError> {
        match count {
            1 => Ok(Self::One),
            3 => Ok(Self::Three),
            5 => Ok(Self::Five),
            n => Err(RosterError::InvalidPanelSize(n)),
        }
    }

    pub fn judges(&self) -> usize {
        match self {
            Self::One => 1,
            Self::Three => 3,
            Self::Five => 5,
        }
    }

    /// Whether each competitor's highest and lowest judge are discarded.
    pub fn drops_extremes(&self) -> bool {
        matches!(self, Self::Five)
    }
}

impl TryFrom<u8> for PanelSize {
    type Error = RosterError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_judges(value as usize)
    }
}

impl From<PanelSize> for u8 {
    fn from(size: PanelSize) -> Self {
        size.judges() as u8
    }
}

/// Dance performed in a round. Unknown names are rejected.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dance {
    Reel,
    LightJig,
    SingleJig,
    SlipJig,
    TrebleJig,
    Hornpipe,
    TraditionalSet,
    SetDance,
    SoftShoe,
    HardShoe,
}

impl FromStr for Dance {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reel" => Ok(Self::Reel),
            "light_jig" => Ok(Self::LightJig),
            "single_jig" => Ok(Self::SingleJig),
            "slip_jig" => Ok(Self::SlipJig),
            "treble_jig" => Ok(Self::TrebleJig),
            "hornpipe" => Ok(Self::Hornpipe),
            "traditional_set" => Ok(Self::TraditionalSet),
            "set_dance" => Ok(Self::SetDance),
            "soft_shoe" => Ok(Self::SoftShoe),
            "hard_shoe" => Ok(Self::HardShoe),
            other => Err(RosterError::Parse(format!("unknown dance: {other}"))),
        }
    }
}

/// Competition level. Unknown names are rejected.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Beginner,
    AdvancedBeginner,
    Novice,
    PrizeWinner,
    Preliminary,
    Open,
}

impl FromStr for Level {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(Self::Beginner),
            "advanced_beginner" => Ok(Self::AdvancedBeginner),
            "novice" => Ok(Self::Novice),
            "prize_winner" => Ok(Self::PrizeWinner),
            "preliminary" => Ok(Self::Preliminary),
            "open" => Ok(Self::Open),
            other => Err(RosterError::Parse(format!("unknown level: {other}"))),
        }
    }
}

/// Whether an entered competitor is dancing in a round.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default, bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    #[default]
    Present,
    /// Not dancing; excluded from ranking.
    Absent,
    /// Marked as a no-show; ranked per the configured no-show policy.
    NoShow,
}

impl FromStr for Presence {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            "no_show" => Ok(Self::NoShow),
            other => Err(RosterError::Parse(format!("unknown presence: {other}"))),
        }
    }
}

/// A competition and its level.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompetitionSpec {
    pub id: CompetitionId,
    pub name: String,
    pub level: Level,
}

/// Layout of one round: where it sits in its competition and who judges it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RoundSpec {
    pub id: RoundId,
    pub competition: CompetitionId,
    /// 1-based position within the competition.
    pub sequence: u32,
    pub dance: Dance,
    pub judges: Vec<JudgeId>,
}

impl RoundSpec {
    pub fn panel_size(&self) -> Result<PanelSize, RosterError> {
        PanelSize::from_judges(self.judges.len())
    }

    pub fn has_judge(&self, judge: JudgeId) -> bool {
        self.judges.contains(&judge)
    }
}
