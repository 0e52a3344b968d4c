//! Engine constants. All points values are fixed-point (see [`POINTS_PRECISION`]).

/// Lowest raw mark a judge may award.
pub const MARK_MIN: f64 = 0.0;

/// Highest raw mark a judge may award.
pub const MARK_MAX: f64 = 100.0;

/// Fixed-point denominator for converted points (micro-points).
///
/// Split points are divided in this precision so that a tie between 2nd and
/// 3rd (`(75 + 65) / 2`) is exact and every device computes identical bits.
pub const POINTS_PRECISION: u64 = 1_000_000;

/// Number of placements that earn points. Placements beyond this earn zero.
pub const SCORED_PLACEMENTS: usize = 50;

/// Whole points awarded per placement, 1st through 50th.
///
/// Placements 1-10 follow the published conversion table. Placements 11-49
/// are the default sequence (41, 39, then one point less per placement)
/// that lands on 1 point at 50th. A governing-body table can replace this
/// at runtime through `PointsTable::from_whole_points`.
pub const STANDARD_POINTS: [u64; SCORED_PLACEMENTS] = [
    100, 75, 65, 60, 56, 53, 50, 47, 45, 43, // 1-10
    41, 39, 38, 37, 36, 35, 34, 33, 32, 31, // 11-20
    30, 29, 28, 27, 26, 25, 24, 23, 22, 21, // 21-30
    20, 19, 18, 17, 16, 15, 14, 13, 12, 11, // 31-40
    10, 9, 8, 7, 6, 5, 4, 3, 2, 1, // 41-50
];

/// Default share of the field recalled after the prior rounds, in percent.
pub const DEFAULT_RECALL_PERCENT: u32 = 50;

/// Default window (ms) within which two origins' timestamps for the same
/// cell are treated as ambiguous during reconciliation.
pub const DEFAULT_CONFLICT_WINDOW_MS: u64 = 2_000;

/// Default JSON-RPC port for the results server.
pub const DEFAULT_RPC_PORT: u16 = 18432;

/// Default per-round broadcast buffer (messages held for slow subscribers).
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// Default timeout for a device's submission to the server.
pub const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 3_000;

/// Sequence carried by writes that do not come from a device outbox.
/// Outbox sequences start at 1.
pub const UNSEQUENCED: u64 = 0;

/// Origin prefix stamped on cells written through the correction path.
pub const ADMIN_ORIGIN_PREFIX: &str = "admin:";
