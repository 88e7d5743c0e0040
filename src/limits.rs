use crate::model::Ms;

// ── Validation limits ────────────────────────────────────────────

pub const MAX_SPACES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_COMMENT_LEN: usize = 2_048;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_RESERVATIONS_PER_SPACE: usize = 100_000;
pub const MAX_WAITLIST_PER_SPACE: usize = 10_000;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z — anything later is a client bug.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

// ── Lifecycle policy ─────────────────────────────────────────────

/// Every reservation occupies exactly one fixed-length slot.
pub const SLOT_DURATION_MS: Ms = 3_600_000;

/// Check-in is accepted until `start + CHECK_IN_GRACE_MS`.
pub const CHECK_IN_GRACE_MS: Ms = 600_000;

/// The no-show sweep marks approved reservations older than this.
pub const NO_SHOW_GRACE_MS: Ms = 600_000;

/// Reminders go out when the start time is at most this far away.
pub const REMINDER_LEAD_MS: Ms = 1_800_000;
