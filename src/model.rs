use chrono::DateTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Opaque identity from the external auth provider.
pub type UserId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

/// UTC calendar day of a timestamp, as the `YYYY-MM-DD` stats key.
pub fn day_key(t: Ms) -> String {
    DateTime::from_timestamp_millis(t)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "out-of-range".to_string())
}

// ── Spaces ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceKind {
    Program,
    Room,
    StudyRoom,
}

impl SpaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceKind::Program => "program",
            SpaceKind::Room => "room",
            SpaceKind::StudyRoom => "studyroom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "program" => Some(SpaceKind::Program),
            "room" => Some(SpaceKind::Room),
            "studyroom" => Some(SpaceKind::StudyRoom),
            _ => None,
        }
    }
}

/// A bookable space. Immutable as far as the lifecycle engine is concerned;
/// only admin CRUD touches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Ulid,
    pub name: String,
    pub kind: SpaceKind,
    /// Max concurrent active reservations per slot.
    pub capacity: u32,
    pub description: String,
    pub location: String,
    pub image_ref: Option<String>,
}

/// Partial update applied by admin `UPDATE spaces` commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpacePatch {
    pub name: Option<String>,
    pub kind: Option<SpaceKind>,
    pub capacity: Option<u32>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub image_ref: Option<String>,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    CheckedIn,
    NoShow,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "approved" => Some(ReservationStatus::Approved),
            "rejected" => Some(ReservationStatus::Rejected),
            "cancelled" => Some(ReservationStatus::Cancelled),
            "checked_in" => Some(ReservationStatus::CheckedIn),
            "no_show" => Some(ReservationStatus::NoShow),
            _ => None,
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Rejected
                | ReservationStatus::Cancelled
                | ReservationStatus::CheckedIn
                | ReservationStatus::NoShow
        )
    }

    /// Active statuses count toward a slot's capacity.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending
                | ReservationStatus::Approved
                | ReservationStatus::CheckedIn
        )
    }

    /// The full transition relation of the lifecycle state machine.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Cancelled)
                | (Approved, CheckedIn)
                | (Approved, NoShow)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub user_id: UserId,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub check_in_time: Option<Ms>,
    pub reminder_sent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub space_id: Ulid,
    pub user_id: UserId,
    /// 1-based queue position at insertion time.
    pub position: u32,
    pub created_at: Ms,
}

// ── Feedback, stats, profiles ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Ulid,
    pub program_id: Ulid,
    pub user_id: UserId,
    /// 1–5, validated at submission.
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: Ms,
}

/// Per-(day, space) counters maintained by the stats aggregator.
/// The average rating is derived on read so increments stay atomic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: String,
    pub space_id: Ulid,
    pub reservation_count: u64,
    pub check_in_count: u64,
    pub no_show_count: u64,
    pub rating_sum: u64,
    pub rating_count: u64,
}

impl DailyStats {
    pub fn empty(day: String, space_id: Ulid) -> Self {
        Self {
            day,
            space_id,
            reservation_count: 0,
            check_in_count: 0,
            no_show_count: 0,
            rating_sum: 0,
            rating_count: 0,
        }
    }

    pub fn average_rating(&self) -> f64 {
        if self.rating_count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.rating_count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub device_token: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub admin: bool,
}

// ── Per-space state ──────────────────────────────────────────────

/// A space plus every document scoped to it. All slot admission and status
/// transitions for the space serialize on the lock wrapping this struct.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub space: Space,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Insertion order is the FIFO promotion queue.
    pub waitlist: Vec<WaitlistEntry>,
}

impl SpaceState {
    pub fn new(space: Space) -> Self {
        Self {
            space,
            reservations: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn remove_waitlist_entry(&mut self, id: Ulid) -> Option<WaitlistEntry> {
        if let Some(pos) = self.waitlist.iter().position(|w| w.id == id) {
            Some(self.waitlist.remove(pos))
        } else {
            None
        }
    }

    /// Count of reservations occupying the exact slot at `start`.
    pub fn slot_occupancy(&self, start: Ms) -> usize {
        self.reservations
            .iter()
            .filter(|r| r.span.start == start && r.status.is_active())
            .count()
    }
}

// ── Events ───────────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format and
/// the payload published on the notify hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        space: Space,
    },
    SpaceUpdated {
        space: Space,
    },
    SpaceDeleted {
        id: Ulid,
    },
    UserUpserted {
        profile: UserProfile,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationApproved {
        id: Ulid,
        space_id: Ulid,
    },
    ReservationRejected {
        id: Ulid,
        space_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        space_id: Ulid,
    },
    ReservationCheckedIn {
        id: Ulid,
        space_id: Ulid,
        span: Span,
        at: Ms,
    },
    ReservationNoShow {
        id: Ulid,
        space_id: Ulid,
        span: Span,
    },
    ReservationRescheduled {
        id: Ulid,
        space_id: Ulid,
        span: Span,
    },
    ReminderMarked {
        id: Ulid,
        space_id: Ulid,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistRemoved {
        id: Ulid,
        space_id: Ulid,
    },
    FeedbackSubmitted {
        feedback: Feedback,
    },
}

/// Extract the space a scoped event belongs to. `None` for global events
/// (user profiles) and space create/delete, which are handled at the map
/// level rather than under a space lock.
pub fn event_space_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationApproved { space_id, .. }
        | Event::ReservationRejected { space_id, .. }
        | Event::ReservationCancelled { space_id, .. }
        | Event::ReservationCheckedIn { space_id, .. }
        | Event::ReservationNoShow { space_id, .. }
        | Event::ReservationRescheduled { space_id, .. }
        | Event::ReminderMarked { space_id, .. }
        | Event::WaitlistRemoved { space_id, .. } => Some(*space_id),
        Event::ReservationCreated { reservation } => Some(reservation.space_id),
        Event::WaitlistJoined { entry } => Some(entry.space_id),
        Event::SpaceUpdated { space } => Some(space.id),
        Event::FeedbackSubmitted { feedback } => Some(feedback.program_id),
        Event::SpaceCreated { .. } | Event::SpaceDeleted { .. } | Event::UserUpserted { .. } => {
            None
        }
    }
}

// ── Command outcomes ─────────────────────────────────────────────

/// Result of a reservation request: admitted, or diverted to the waitlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { id: Ulid },
    Waitlisted { id: Ulid, position: u32 },
}

/// Result of scanning a check-in token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInOutcome {
    CheckedIn { id: Ulid, at: Ms },
    NoShow { id: Ulid },
    /// Re-scan of an already checked-in reservation — idempotent no-op.
    AlreadyCheckedIn { id: Ulid },
    /// The reservation exists but is not in a checkable state.
    NotCheckable { id: Ulid, status: ReservationStatus },
    /// Token did not decode, or no such reservation.
    Invalid,
}

impl CheckInOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInOutcome::CheckedIn { .. } => "checked_in",
            CheckInOutcome::NoShow { .. } => "no_show",
            CheckInOutcome::AlreadyCheckedIn { .. } => "already_checked_in",
            CheckInOutcome::NotCheckable { .. } => "not_approved",
            CheckInOutcome::Invalid => "invalid",
        }
    }
}
