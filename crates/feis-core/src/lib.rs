//! # feis-core
//! Foundation types, the score ledger, and the roster for Feis tabulation.

pub mod constants;
pub mod error;
pub mod ledger;
pub mod merge;
pub mod roster;
pub mod traits;
pub mod types;
