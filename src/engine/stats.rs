use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

type StatsMap = DashMap<(String, Ulid), DailyStats>;

fn bump(stats: &StatsMap, day: String, space_id: Ulid) -> RefMut<'_, (String, Ulid), DailyStats> {
    let key = (day, space_id);
    stats
        .entry(key.clone())
        .or_insert_with(|| DailyStats::empty(key.0, key.1))
}

/// The statistics aggregator — an explicit subscriber for reservation and
/// feedback writes. Counters are incremented under the DashMap entry lock,
/// so concurrent events for the same (day, space) never lose updates.
///
/// Reservation events count toward the UTC day of the slot's start time;
/// feedback counts toward the day it was submitted.
pub(super) fn record(stats: &StatsMap, event: &Event) {
    match event {
        Event::ReservationCreated { reservation } => {
            let mut s = bump(stats, day_key(reservation.span.start), reservation.space_id);
            s.reservation_count += 1;
            // A compacted WAL replays reservations with their final status,
            // so the derived counters must be reconstructed here too.
            match reservation.status {
                ReservationStatus::CheckedIn => s.check_in_count += 1,
                ReservationStatus::NoShow => s.no_show_count += 1,
                _ => {}
            }
        }
        Event::ReservationCheckedIn { space_id, span, .. } => {
            bump(stats, day_key(span.start), *space_id).check_in_count += 1;
        }
        Event::ReservationNoShow { space_id, span, .. } => {
            bump(stats, day_key(span.start), *space_id).no_show_count += 1;
        }
        Event::FeedbackSubmitted { feedback } => {
            let mut s = bump(stats, day_key(feedback.created_at), feedback.program_id);
            s.rating_sum += feedback.rating as u64;
            s.rating_count += 1;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Ms = 86_400_000;

    fn created(space_id: Ulid, start: Ms, status: ReservationStatus) -> Event {
        Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                space_id,
                user_id: "u".into(),
                span: Span::new(start, start + 3_600_000),
                status,
                created_at: start,
                check_in_time: None,
                reminder_sent: false,
            },
        }
    }

    #[test]
    fn counts_accumulate_per_day_and_space() {
        let stats = StatsMap::new();
        let a = Ulid::new();
        let b = Ulid::new();

        record(&stats, &created(a, 0, ReservationStatus::Pending));
        record(&stats, &created(a, 1000, ReservationStatus::Pending));
        record(&stats, &created(b, 1000, ReservationStatus::Pending));
        record(&stats, &created(a, DAY, ReservationStatus::Pending));

        assert_eq!(stats.get(&(day_key(0), a)).unwrap().reservation_count, 2);
        assert_eq!(stats.get(&(day_key(0), b)).unwrap().reservation_count, 1);
        assert_eq!(stats.get(&(day_key(DAY), a)).unwrap().reservation_count, 1);
    }

    #[test]
    fn check_in_and_no_show_counters() {
        let stats = StatsMap::new();
        let sid = Ulid::new();
        let span = Span::new(1000, 3_601_000);

        record(
            &stats,
            &Event::ReservationCheckedIn { id: Ulid::new(), space_id: sid, span, at: 2000 },
        );
        record(&stats, &Event::ReservationNoShow { id: Ulid::new(), space_id: sid, span });
        record(&stats, &Event::ReservationNoShow { id: Ulid::new(), space_id: sid, span });

        let s = stats.get(&(day_key(1000), sid)).unwrap();
        assert_eq!(s.check_in_count, 1);
        assert_eq!(s.no_show_count, 2);
        assert_eq!(s.reservation_count, 0);
    }

    #[test]
    fn compacted_replay_restores_derived_counters() {
        let stats = StatsMap::new();
        let sid = Ulid::new();

        record(&stats, &created(sid, 0, ReservationStatus::CheckedIn));
        record(&stats, &created(sid, 0, ReservationStatus::NoShow));
        record(&stats, &created(sid, 0, ReservationStatus::Cancelled));

        let s = stats.get(&(day_key(0), sid)).unwrap();
        assert_eq!(s.reservation_count, 3);
        assert_eq!(s.check_in_count, 1);
        assert_eq!(s.no_show_count, 1);
    }

    #[test]
    fn ratings_aggregate() {
        let stats = StatsMap::new();
        let sid = Ulid::new();
        for rating in [5u8, 4] {
            record(
                &stats,
                &Event::FeedbackSubmitted {
                    feedback: Feedback {
                        id: Ulid::new(),
                        program_id: sid,
                        user_id: format!("u{rating}"),
                        rating,
                        comment: None,
                        created_at: 1000,
                    },
                },
            );
        }
        let s = stats.get(&(day_key(1000), sid)).unwrap();
        assert_eq!(s.rating_sum, 9);
        assert_eq!(s.rating_count, 2);
        assert_eq!(s.average_rating(), 4.5);
    }

    #[test]
    fn unrelated_events_ignored() {
        let stats = StatsMap::new();
        record(&stats, &Event::SpaceDeleted { id: Ulid::new() });
        record(
            &stats,
            &Event::ReminderMarked { id: Ulid::new(), space_id: Ulid::new() },
        );
        assert!(stats.is_empty());
    }
}
