use crate::limits::*;
use crate::model::{Ms, Reservation, Span};

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Slots are fixed-length; the end time is derived, never supplied.
pub(crate) fn slot_span(start: Ms) -> Span {
    Span::new(start, start + SLOT_DURATION_MS)
}

pub(crate) fn validate_start(start: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS - SLOT_DURATION_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Check-in is accepted up to the grace deadline, inclusive.
pub(crate) fn within_check_in_window(start: Ms, now: Ms) -> bool {
    now <= start + CHECK_IN_GRACE_MS
}

/// An approved reservation this far past its start is a no-show.
pub(crate) fn no_show_overdue(start: Ms, now: Ms) -> bool {
    start <= now - NO_SHOW_GRACE_MS
}

/// Reminder window: start time within [now, now + lead], not yet reminded.
pub(crate) fn reminder_due(reservation: &Reservation, now: Ms) -> bool {
    !reservation.reminder_sent
        && reservation.span.start >= now
        && reservation.span.start <= now + REMINDER_LEAD_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationStatus;
    use ulid::Ulid;

    const M: Ms = 60_000;

    fn approved_at(start: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            space_id: Ulid::new(),
            user_id: "u".into(),
            span: slot_span(start),
            status: ReservationStatus::Approved,
            created_at: 0,
            check_in_time: None,
            reminder_sent: false,
        }
    }

    #[test]
    fn slot_span_is_one_hour() {
        let s = slot_span(1_000_000);
        assert_eq!(s.duration_ms(), SLOT_DURATION_MS);
    }

    #[test]
    fn start_validation_range() {
        assert!(validate_start(0).is_ok());
        assert!(validate_start(-1).is_err());
        assert!(validate_start(MAX_VALID_TIMESTAMP_MS).is_err());
    }

    #[test]
    fn check_in_window_boundaries() {
        // start 10:00, grace 10 min: 10:09 ok, 10:10 ok (inclusive), 10:11 late
        let start = 36_000_000;
        assert!(within_check_in_window(start, start + 9 * M));
        assert!(within_check_in_window(start, start + 10 * M));
        assert!(!within_check_in_window(start, start + 11 * M));
        // Scanning before start is fine
        assert!(within_check_in_window(start, start - 30 * M));
    }

    #[test]
    fn no_show_cutoff_boundaries() {
        let now = 100 * M;
        assert!(no_show_overdue(now - 11 * M, now));
        assert!(no_show_overdue(now - 10 * M, now));
        assert!(!no_show_overdue(now - 5 * M, now));
        assert!(!no_show_overdue(now + M, now));
    }

    #[test]
    fn reminder_window() {
        let now = 100 * M;
        assert!(reminder_due(&approved_at(now + 20 * M), now));
        assert!(reminder_due(&approved_at(now), now));
        assert!(reminder_due(&approved_at(now + 30 * M), now));
        assert!(!reminder_due(&approved_at(now + 31 * M), now));
        // Already started — reminder would be noise
        assert!(!reminder_due(&approved_at(now - M), now));
        let mut r = approved_at(now + 20 * M);
        r.reminder_sent = true;
        assert!(!reminder_due(&r, now));
    }
}
