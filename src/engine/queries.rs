use ulid::Ulid;

use crate::model::*;

use super::{Engine, SharedSpaceState};

impl Engine {
    fn space_arcs(&self) -> Vec<SharedSpaceState> {
        // Collect the Arcs first so no DashMap shard guard is held across
        // an await.
        self.spaces.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_spaces(&self) -> Vec<Space> {
        let mut out = Vec::new();
        for ss in self.space_arcs() {
            out.push(ss.read().await.space.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn get_space(&self, id: Ulid) -> Option<Space> {
        let ss = self.get_space_state(&id)?;
        let guard = ss.read().await;
        Some(guard.space.clone())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let space_id = self.space_for_reservation(&id)?;
        let ss = self.get_space_state(&space_id)?;
        let guard = ss.read().await;
        guard.reservation(id).cloned()
    }

    /// Listing with optional equality filters, the query shape the
    /// presentation layer uses everywhere.
    pub async fn reservations_filtered(
        &self,
        user_id: Option<&str>,
        space_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    ) -> Vec<Reservation> {
        let arcs = match space_id {
            Some(id) => self.get_space_state(&id).into_iter().collect(),
            None => self.space_arcs(),
        };
        let mut out = Vec::new();
        for ss in arcs {
            let guard = ss.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| user_id.is_none_or(|u| r.user_id == u))
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn reservations_for_user(&self, user_id: &str) -> Vec<Reservation> {
        self.reservations_filtered(Some(user_id), None, None).await
    }

    pub async fn reservations_for_space(&self, space_id: Ulid) -> Vec<Reservation> {
        self.reservations_filtered(None, Some(space_id), None).await
    }

    /// FIFO order — index 0 is the next promotion candidate.
    pub async fn waitlist_for_space(&self, space_id: Ulid) -> Vec<WaitlistEntry> {
        match self.get_space_state(&space_id) {
            Some(ss) => ss.read().await.waitlist.clone(),
            None => Vec::new(),
        }
    }

    pub fn feedback_for_program(&self, program_id: Ulid) -> Vec<Feedback> {
        let mut out: Vec<Feedback> = self
            .feedback
            .iter()
            .filter(|e| e.value().program_id == program_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|f| (f.created_at, f.id));
        out
    }

    pub fn stats_for_day(&self, day: &str) -> Vec<DailyStats> {
        let mut out: Vec<DailyStats> = self
            .stats
            .iter()
            .filter(|e| e.key().0 == day)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.space_id.cmp(&b.space_id));
        out
    }

    pub fn all_stats(&self) -> Vec<DailyStats> {
        let mut out: Vec<DailyStats> = self.stats.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.day.cmp(&b.day).then_with(|| a.space_id.cmp(&b.space_id)));
        out
    }

    pub fn user_profile(&self, user_id: &str) -> Option<UserProfile> {
        self.users.get(user_id).map(|e| e.value().clone())
    }
}
