//! # feis-tabulate: Pure tabulation over ledger snapshots.
//!
//! Nothing here holds state or touches storage; every function maps a
//! snapshot (plus roster data) to derived results, so the server and every
//! judging device compute identical values from identical inputs.
//! - **Points conversion**: one judge's raw marks become placements and
//!   fixed-point points, with tied placements splitting their points.
//! - **Panel aggregation**: per-competitor sums across the panel, dropping
//!   the high and low judge on complete 5-judge panels.
//! - **Round results**: ranked rows flagged provisional until every panel
//!   judge has marked every competitor.
//! - **Recall**: cumulative points across a competition's rounds, cut at a
//!   percentage of the field and extended through ties.

pub mod panel;
pub mod points;
pub mod recall;
pub mod results;
pub mod tiebreak;

pub use panel::{CompetitorTally, RankedTally, aggregate, rank};
pub use points::{JudgeAward, PointsTable, convert};
pub use recall::{RecallEntry, RecallSheet, compute_recall, recall_cut};
pub use results::{NoShowPolicy, ResultRow, RoundResults, TabulationSettings, tabulate_round};
pub use tiebreak::{TieBreak, TieBreakPolicy};
