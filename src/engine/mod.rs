mod error;
mod mutations;
mod policy;
mod queries;
mod stats;

pub use error::EngineError;
pub(crate) use policy::now_ms;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::gateway::NotificationGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::token::TokenCodec;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub spaces: DashMap<Ulid, SharedSpaceState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    gateway: Arc<dyn NotificationGateway>,
    codec: Arc<dyn TokenCodec>,
    /// Reverse lookup: reservation id → space id.
    reservation_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: waitlist entry id → space id.
    waitlist_index: DashMap<Ulid, Ulid>,
    users: DashMap<UserId, UserProfile>,
    feedback: DashMap<Ulid, Feedback>,
    /// (program, user) pairs with feedback on file. DashSet::insert is the
    /// atomic insert-if-absent that enforces one-feedback-per-pair.
    feedback_seen: DashSet<(Ulid, UserId)>,
    /// (day, space) → counters, maintained by the stats aggregator.
    stats: DashMap<(String, Ulid), DailyStats>,
    /// Bootstrap admin ids from the environment.
    admins: HashSet<UserId>,
}

/// Apply a space-scoped event to a SpaceState (no locking — caller holds
/// the lock).
fn apply_to_space(
    ss: &mut SpaceState,
    event: &Event,
    reservation_index: &DashMap<Ulid, Ulid>,
    waitlist_index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::SpaceUpdated { space } => {
            ss.space = space.clone();
        }
        Event::ReservationCreated { reservation } => {
            reservation_index.insert(reservation.id, reservation.space_id);
            ss.insert_reservation(reservation.clone());
        }
        Event::ReservationApproved { id, .. } => {
            if let Some(r) = ss.reservation_mut(*id) {
                r.status = ReservationStatus::Approved;
            }
        }
        Event::ReservationRejected { id, .. } => {
            if let Some(r) = ss.reservation_mut(*id) {
                r.status = ReservationStatus::Rejected;
            }
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = ss.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        Event::ReservationCheckedIn { id, at, .. } => {
            if let Some(r) = ss.reservation_mut(*id) {
                r.status = ReservationStatus::CheckedIn;
                r.check_in_time = Some(*at);
            }
        }
        Event::ReservationNoShow { id, .. } => {
            if let Some(r) = ss.reservation_mut(*id) {
                r.status = ReservationStatus::NoShow;
            }
        }
        Event::ReservationRescheduled { id, span, .. } => {
            // Remove and reinsert to keep the by-start sort order
            if let Some(pos) = ss.reservations.iter().position(|r| r.id == *id) {
                let mut r = ss.reservations.remove(pos);
                r.span = *span;
                ss.insert_reservation(r);
            }
        }
        Event::ReminderMarked { id, .. } => {
            if let Some(r) = ss.reservation_mut(*id) {
                r.reminder_sent = true;
            }
        }
        Event::WaitlistJoined { entry } => {
            waitlist_index.insert(entry.id, entry.space_id);
            ss.waitlist.push(entry.clone());
        }
        Event::WaitlistRemoved { id, .. } => {
            ss.remove_waitlist_entry(*id);
            waitlist_index.remove(id);
        }
        // Handled at the DashMap / global-collection level, not here
        Event::SpaceCreated { .. }
        | Event::SpaceDeleted { .. }
        | Event::UserUpserted { .. }
        | Event::FeedbackSubmitted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gateway: Arc<dyn NotificationGateway>,
        codec: Arc<dyn TokenCodec>,
        admins: HashSet<UserId>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spaces: DashMap::new(),
            wal_tx,
            notify,
            gateway,
            codec,
            reservation_index: DashMap::new(),
            waitlist_index: DashMap::new(),
            users: DashMap::new(),
            feedback: DashMap::new(),
            feedback_seen: DashSet::new(),
            stats: DashMap::new(),
            admins,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            match event {
                Event::SpaceCreated { space } => {
                    engine
                        .spaces
                        .insert(space.id, Arc::new(RwLock::new(SpaceState::new(space.clone()))));
                }
                Event::SpaceDeleted { id } => {
                    engine.purge_space(id);
                }
                Event::UserUpserted { .. } | Event::FeedbackSubmitted { .. } => {
                    engine.apply_global(event);
                }
                other => {
                    if let Some(space_id) = event_space_id(other)
                        && let Some(entry) = engine.spaces.get(&space_id) {
                            let ss_arc = entry.clone();
                            let mut guard = ss_arc.try_write().expect("replay: uncontended write");
                            apply_to_space(
                                &mut guard,
                                other,
                                &engine.reservation_index,
                                &engine.waitlist_index,
                            );
                        }
                }
            }
            stats::record(&engine.stats, event);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_space_state(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn space_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + aggregate + publish in one call.
    pub(super) async fn persist_and_apply(
        &self,
        space_id: Ulid,
        ss: &mut SpaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.reservation_index, &self.waitlist_index);
        stats::record(&self.stats, event);
        self.notify.send(space_id, event);
        Ok(())
    }

    /// Persist an event that is not scoped to a space lock (profiles,
    /// feedback).
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_global(event);
        stats::record(&self.stats, event);
        if let Some(space_id) = event_space_id(event) {
            self.notify.send(space_id, event);
        }
        Ok(())
    }

    fn apply_global(&self, event: &Event) {
        match event {
            Event::UserUpserted { profile } => {
                self.users.insert(profile.user_id.clone(), profile.clone());
            }
            Event::FeedbackSubmitted { feedback } => {
                self.feedback_seen
                    .insert((feedback.program_id, feedback.user_id.clone()));
                self.feedback.insert(feedback.id, feedback.clone());
            }
            _ => {}
        }
    }

    /// Drop a space and every index entry pointing into it. Replay only —
    /// the uncontended try_read would panic under live traffic, so the live
    /// delete path collects its ids under its own lock instead.
    fn purge_space(&self, id: &Ulid) {
        if let Some((_, ss)) = self.spaces.remove(id) {
            let guard = ss.try_read().expect("replay purge: uncontended read");
            for r in &guard.reservations {
                self.reservation_index.remove(&r.id);
            }
            for w in &guard.waitlist {
                self.waitlist_index.remove(&w.id);
            }
        }
    }

    /// Live-path space removal given ids already read under the space lock.
    pub(super) fn remove_space(&self, id: &Ulid, reservation_ids: &[Ulid], waitlist_ids: &[Ulid]) {
        self.spaces.remove(id);
        for rid in reservation_ids {
            self.reservation_index.remove(rid);
        }
        for wid in waitlist_ids {
            self.waitlist_index.remove(wid);
        }
    }

    /// Lookup reservation → space, get space, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SpaceState>), EngineError> {
        let space_id = self
            .space_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let guard = ss.write_owned().await;
        Ok((space_id, guard))
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
            || self.users.get(user_id).is_some_and(|p| p.admin)
    }

    pub(super) fn require_admin(&self, actor: &str) -> Result<(), EngineError> {
        if self.is_admin(actor) {
            Ok(())
        } else {
            Err(EngineError::NotAuthorized(actor.to_string()))
        }
    }

    pub(super) fn decode_token(&self, token: &str) -> Option<Ulid> {
        self.codec.decode(token)
    }

    /// Fire-and-forget push notification. A delivery failure is logged and
    /// swallowed — it must never roll back or block the state transition
    /// that triggered it.
    pub(super) async fn notify_user(&self, user_id: &str, title: &str, body: &str) {
        let token = self
            .users
            .get(user_id)
            .and_then(|p| p.value().device_token.clone());
        let Some(token) = token else {
            tracing::debug!("no device token for {user_id}, skipping notification");
            return;
        };
        match self.gateway.deliver(&token, title, body).await {
            Ok(()) => tracing::debug!("notification sent to {user_id}"),
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL).increment(1);
                tracing::warn!("notification to {user_id} failed: {e}");
            }
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let space_arcs: Vec<SharedSpaceState> =
            self.spaces.iter().map(|e| e.value().clone()).collect();
        for ss in space_arcs {
            let guard = ss.read().await;
            events.push(Event::SpaceCreated {
                space: guard.space.clone(),
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
            for w in &guard.waitlist {
                events.push(Event::WaitlistJoined { entry: w.clone() });
            }
        }
        for profile in self.users.iter() {
            events.push(Event::UserUpserted {
                profile: profile.value().clone(),
            });
        }
        for fb in self.feedback.iter() {
            events.push(Event::FeedbackSubmitted {
                feedback: fb.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
