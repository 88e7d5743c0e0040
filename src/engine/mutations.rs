use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::policy::{
    no_show_overdue, now_ms, reminder_due, slot_span, validate_start, within_check_in_window,
};
use super::{Engine, EngineError, SharedSpaceState};

fn check_transition(
    current: ReservationStatus,
    to: ReservationStatus,
) -> Result<(), EngineError> {
    if current.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from: current, to })
    }
}

fn validate_space(space: &Space) -> Result<(), EngineError> {
    if space.name.is_empty() || space.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("space name length"));
    }
    if space.description.len() > MAX_TEXT_LEN || space.location.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded("space text field too long"));
    }
    if space.capacity == 0 {
        return Err(EngineError::LimitExceeded("capacity must be positive"));
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id length"));
    }
    Ok(())
}

impl Engine {
    // ── Space CRUD (admin) ───────────────────────────────

    pub async fn create_space(&self, space: Space, actor: &str) -> Result<(), EngineError> {
        self.require_admin(actor)?;
        validate_space(&space)?;
        if self.spaces.len() >= MAX_SPACES {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }
        if self.spaces.contains_key(&space.id) {
            return Err(EngineError::AlreadyExists(space.id));
        }

        let event = Event::SpaceCreated { space: space.clone() };
        self.wal_append(&event).await?;
        let id = space.id;
        self.spaces
            .insert(id, Arc::new(RwLock::new(SpaceState::new(space))));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_space(
        &self,
        id: Ulid,
        patch: SpacePatch,
        actor: &str,
    ) -> Result<(), EngineError> {
        self.require_admin(actor)?;
        let ss = self
            .get_space_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;

        let mut space = guard.space.clone();
        if let Some(name) = patch.name {
            space.name = name;
        }
        if let Some(kind) = patch.kind {
            space.kind = kind;
        }
        if let Some(capacity) = patch.capacity {
            space.capacity = capacity;
        }
        if let Some(description) = patch.description {
            space.description = description;
        }
        if let Some(location) = patch.location {
            space.location = location;
        }
        if let Some(image_ref) = patch.image_ref {
            space.image_ref = Some(image_ref);
        }
        validate_space(&space)?;

        let event = Event::SpaceUpdated { space };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn delete_space(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        self.require_admin(actor)?;
        let ss = self
            .get_space_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        let live = guard.reservations.iter().any(|r| !r.status.is_terminal())
            || !guard.waitlist.is_empty();
        if live {
            return Err(EngineError::SpaceInUse(id));
        }
        let reservation_ids: Vec<Ulid> = guard.reservations.iter().map(|r| r.id).collect();
        let waitlist_ids: Vec<Ulid> = guard.waitlist.iter().map(|w| w.id).collect();
        drop(guard);

        let event = Event::SpaceDeleted { id };
        self.wal_append(&event).await?;
        self.remove_space(&id, &reservation_ids, &waitlist_ids);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Profiles ─────────────────────────────────────────

    /// Sign-in upsert. A non-admin may only write their own profile and
    /// cannot grant themselves the admin flag; a previously granted flag
    /// survives the upsert.
    pub async fn upsert_user(
        &self,
        mut profile: UserProfile,
        actor: &str,
    ) -> Result<(), EngineError> {
        validate_user_id(&profile.user_id)?;
        if !self.is_admin(actor) {
            if actor != profile.user_id {
                return Err(EngineError::NotAuthorized(actor.to_string()));
            }
            profile.admin = self
                .user_profile(&profile.user_id)
                .is_some_and(|p| p.admin);
        }
        self.persist_global(&Event::UserUpserted { profile }).await
    }

    // ── Reservation lifecycle ────────────────────────────

    /// Slot admission. Holding the space write lock across the
    /// count-then-insert makes the capacity check and the insert one
    /// atomic step — concurrent requests for the same slot serialize here.
    pub async fn create_reservation(
        &self,
        space_id: Ulid,
        user_id: &str,
        start: Ms,
    ) -> Result<ReserveOutcome, EngineError> {
        validate_start(start)?;
        validate_user_id(user_id)?;
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let mut guard = ss.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many reservations on space"));
        }

        let capacity = guard.space.capacity as usize;
        let occupied = guard.slot_occupancy(start);
        let now = now_ms();

        if occupied >= capacity {
            if guard.waitlist.len() >= MAX_WAITLIST_PER_SPACE {
                return Err(EngineError::LimitExceeded("waitlist full"));
            }
            let entry = WaitlistEntry {
                id: Ulid::new(),
                space_id,
                user_id: user_id.to_string(),
                position: (occupied - capacity + 1) as u32,
                created_at: now,
            };
            let (id, position) = (entry.id, entry.position);
            self.persist_and_apply(space_id, &mut guard, &Event::WaitlistJoined { entry })
                .await?;
            metrics::counter!(observability::RESERVATIONS_WAITLISTED_TOTAL).increment(1);
            return Ok(ReserveOutcome::Waitlisted { id, position });
        }

        let reservation = Reservation {
            id: Ulid::new(),
            space_id,
            user_id: user_id.to_string(),
            span: slot_span(start),
            status: ReservationStatus::Pending,
            created_at: now,
            check_in_time: None,
            reminder_sent: false,
        };
        let id = reservation.id;
        self.persist_and_apply(space_id, &mut guard, &Event::ReservationCreated { reservation })
            .await?;
        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        Ok(ReserveOutcome::Reserved { id })
    }

    /// User cancellation, permitted from pending or approved only.
    pub async fn cancel_reservation(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let (space_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if r.user_id != actor && !self.is_admin(actor) {
            return Err(EngineError::NotAuthorized(actor.to_string()));
        }
        check_transition(r.status, ReservationStatus::Cancelled)?;
        self.persist_and_apply(space_id, &mut guard, &Event::ReservationCancelled { id, space_id })
            .await
    }

    /// Admin approval. After the transition commits, the owner is notified
    /// and at most one waitlist entry for the space is promoted (FIFO).
    /// Each post-commit step is independently log-and-continue: there is no
    /// cross-step transaction to roll back.
    pub async fn approve_reservation(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        self.require_admin(actor)?;
        let (space_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        check_transition(r.status, ReservationStatus::Approved)?;
        let owner = r.user_id.clone();
        let span = r.span;

        self.persist_and_apply(space_id, &mut guard, &Event::ReservationApproved { id, space_id })
            .await?;
        self.notify_user(
            &owner,
            "Reservation approved",
            "Your reservation has been approved. Have your QR code ready.",
        )
        .await;

        if let Some(entry) = guard.waitlist.first().cloned() {
            let promoted = Reservation {
                id: Ulid::new(),
                space_id,
                user_id: entry.user_id.clone(),
                span,
                status: ReservationStatus::Approved,
                created_at: now_ms(),
                check_in_time: None,
                reminder_sent: false,
            };
            let promoted_id = promoted.id;
            match self
                .persist_and_apply(
                    space_id,
                    &mut guard,
                    &Event::ReservationCreated { reservation: promoted },
                )
                .await
            {
                Ok(()) => {
                    metrics::counter!(observability::PROMOTIONS_TOTAL).increment(1);
                    self.notify_user(
                        &entry.user_id,
                        "Promoted from waitlist",
                        "A spot opened up and your reservation is confirmed.",
                    )
                    .await;
                    if let Err(e) = self
                        .persist_and_apply(
                            space_id,
                            &mut guard,
                            &Event::WaitlistRemoved { id: entry.id, space_id },
                        )
                        .await
                    {
                        tracing::warn!(
                            "waitlist entry {} consumed by promotion {promoted_id} but not removed: {e}",
                            entry.id
                        );
                    }
                }
                Err(e) => tracing::warn!("waitlist promotion for space {space_id} failed: {e}"),
            }
        }

        Ok(())
    }

    pub async fn reject_reservation(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        self.require_admin(actor)?;
        let (space_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        check_transition(r.status, ReservationStatus::Rejected)?;
        let owner = r.user_id.clone();
        self.persist_and_apply(space_id, &mut guard, &Event::ReservationRejected { id, space_id })
            .await?;
        self.notify_user(
            &owner,
            "Reservation rejected",
            "Your reservation was declined. Please try another time slot.",
        )
        .await;
        Ok(())
    }

    // ── Check-in ─────────────────────────────────────────

    /// Validate a scanned token against the check-in window. Within the
    /// grace period the reservation checks in; past it the scan itself
    /// marks the no-show. Non-approved states never mutate.
    pub async fn check_in(&self, token: &str, now: Ms) -> Result<CheckInOutcome, EngineError> {
        let Some(id) = self.decode_token(token) else {
            return Ok(CheckInOutcome::Invalid);
        };
        let Some(space_id) = self.space_for_reservation(&id) else {
            return Ok(CheckInOutcome::Invalid);
        };
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let mut guard = ss.write().await;
        let Some(r) = guard.reservation(id) else {
            return Ok(CheckInOutcome::Invalid);
        };

        match r.status {
            ReservationStatus::Approved => {
                let span = r.span;
                if within_check_in_window(span.start, now) {
                    self.persist_and_apply(
                        space_id,
                        &mut guard,
                        &Event::ReservationCheckedIn { id, space_id, span, at: now },
                    )
                    .await?;
                    metrics::counter!(observability::CHECKINS_TOTAL).increment(1);
                    Ok(CheckInOutcome::CheckedIn { id, at: now })
                } else {
                    self.persist_and_apply(
                        space_id,
                        &mut guard,
                        &Event::ReservationNoShow { id, space_id, span },
                    )
                    .await?;
                    metrics::counter!(observability::NO_SHOWS_MARKED_TOTAL).increment(1);
                    Ok(CheckInOutcome::NoShow { id })
                }
            }
            ReservationStatus::CheckedIn => Ok(CheckInOutcome::AlreadyCheckedIn { id }),
            status => Ok(CheckInOutcome::NotCheckable { id, status }),
        }
    }

    // ── Feedback ─────────────────────────────────────────

    pub async fn submit_feedback(
        &self,
        program_id: Ulid,
        user_id: &str,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Ulid, EngineError> {
        validate_user_id(user_id)?;
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(EngineError::LimitExceeded("rating out of range"));
        }
        if comment.as_ref().is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
            return Err(EngineError::LimitExceeded("comment too long"));
        }
        if !self.spaces.contains_key(&program_id) {
            return Err(EngineError::NotFound(program_id));
        }

        // Reserve the (program, user) pair atomically; roll the reservation
        // back if the WAL append fails.
        let key = (program_id, user_id.to_string());
        if !self.feedback_seen.insert(key.clone()) {
            return Err(EngineError::DuplicateFeedback {
                program_id,
                user_id: user_id.to_string(),
            });
        }

        let feedback = Feedback {
            id: Ulid::new(),
            program_id,
            user_id: user_id.to_string(),
            rating,
            comment,
            created_at: now_ms(),
        };
        let id = feedback.id;
        if let Err(e) = self.persist_global(&Event::FeedbackSubmitted { feedback }).await {
            self.feedback_seen.remove(&key);
            return Err(e);
        }
        Ok(id)
    }

    // ── Reschedule ───────────────────────────────────────

    /// Move a pending or approved reservation to another slot. Admission is
    /// re-run at the target slot (excluding the reservation itself); a full
    /// slot fails the reschedule instead of diverting to the waitlist.
    pub async fn reschedule_reservation(
        &self,
        id: Ulid,
        actor: &str,
        new_start: Ms,
    ) -> Result<(), EngineError> {
        validate_start(new_start)?;
        let (space_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if r.user_id != actor && !self.is_admin(actor) {
            return Err(EngineError::NotAuthorized(actor.to_string()));
        }
        if !matches!(
            r.status,
            ReservationStatus::Pending | ReservationStatus::Approved
        ) {
            return Err(EngineError::NotReschedulable(r.status));
        }

        let capacity = guard.space.capacity as usize;
        let occupied = guard
            .reservations
            .iter()
            .filter(|o| o.id != id && o.span.start == new_start && o.status.is_active())
            .count();
        if occupied >= capacity {
            return Err(EngineError::SlotFull { space_id, start: new_start });
        }

        self.persist_and_apply(
            space_id,
            &mut guard,
            &Event::ReservationRescheduled { id, space_id, span: slot_span(new_start) },
        )
        .await
    }

    // ── Sweeps ───────────────────────────────────────────

    /// Mark every approved reservation past the no-show grace as no_show,
    /// batched per space under its write lock. Idempotent: a reservation
    /// already out of approved no longer matches.
    pub async fn sweep_no_shows(&self, now: Ms) -> usize {
        let space_arcs: Vec<(Ulid, SharedSpaceState)> = self
            .spaces
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut marked = 0usize;
        for (space_id, ss) in space_arcs {
            let mut guard = ss.write().await;
            let overdue: Vec<(Ulid, Span)> = guard
                .reservations
                .iter()
                .filter(|r| {
                    r.status == ReservationStatus::Approved && no_show_overdue(r.span.start, now)
                })
                .map(|r| (r.id, r.span))
                .collect();
            for (id, span) in overdue {
                match self
                    .persist_and_apply(
                        space_id,
                        &mut guard,
                        &Event::ReservationNoShow { id, space_id, span },
                    )
                    .await
                {
                    Ok(()) => {
                        marked += 1;
                        metrics::counter!(observability::NO_SHOWS_MARKED_TOTAL).increment(1);
                    }
                    Err(e) => tracing::warn!("no-show sweep skip {id}: {e}"),
                }
            }
        }
        marked
    }

    /// Send at most one check-in reminder per approved reservation whose
    /// start time is within the lead window. The check-then-set runs under
    /// the space write lock, so overlapping sweep ticks cannot double-send.
    pub async fn sweep_reminders(&self, now: Ms) -> usize {
        let space_arcs: Vec<(Ulid, SharedSpaceState)> = self
            .spaces
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut sent = 0usize;
        for (space_id, ss) in space_arcs {
            let mut guard = ss.write().await;
            let due: Vec<(Ulid, UserId)> = guard
                .reservations
                .iter()
                .filter(|r| r.status == ReservationStatus::Approved && reminder_due(r, now))
                .map(|r| (r.id, r.user_id.clone()))
                .collect();
            for (id, user_id) in due {
                self.notify_user(
                    &user_id,
                    "Check-in reminder",
                    "Your reservation starts within 30 minutes. Have your QR code ready.",
                )
                .await;
                match self
                    .persist_and_apply(space_id, &mut guard, &Event::ReminderMarked { id, space_id })
                    .await
                {
                    Ok(()) => {
                        sent += 1;
                        metrics::counter!(observability::REMINDERS_SENT_TOTAL).increment(1);
                    }
                    Err(e) => tracing::warn!("reminder sweep: mark {id} failed: {e}"),
                }
            }
        }
        sent
    }
}
