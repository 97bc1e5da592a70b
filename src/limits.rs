use crate::model::{HOUR, Ms};

/// Earliest instant the engine accepts (Unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 10000-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_800_000;

/// Widest span anything may occupy. Vacations can run long, so this is a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * HOUR;
/// A single reservation never runs past a day.
pub const MAX_RESERVATION_DURATION_MS: Ms = 24 * HOUR;
/// Widest window accepted by agenda / free-slot queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * HOUR;

pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_INTERVALS_PER_THERAPIST: usize = 100_000;
pub const MAX_LINE_ITEMS_PER_TRANSACTION: usize = 256;
/// Largest total a single transaction may carry, in minor currency units.
pub const MAX_TRANSACTION_TOTAL: i64 = 1_000_000_000_000;

/// How many times a move re-reads a reservation that changed therapist
/// between lookup and lock acquisition before giving up.
pub const MAX_LOCK_ATTEMPTS: usize = 3;
