//! Cross-crate test suite for Feis.
//!
//! Drives a results server from submission through tabulation, recall,
//! and device reconciliation, and checks the ordering and idempotence
//! guarantees under generated inputs.

pub mod helpers;
