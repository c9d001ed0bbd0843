//! One student's walk through the booking wizard: pick filters, look at the
//! slots, hold one of them, confirm. The flow owns at most one reservation
//! lock at a time and gives it back whenever the student moves on.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{BookingError, Engine, EngineError, FailureKind};
use crate::locks::{Acquire, LockEntry, LockKey, LockToken};
use crate::model::{Booking, Slot, VehicleType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filters {
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub vehicle_type: VehicleType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub slot: Slot,
    pub token: LockToken,
    pub expires_at: i64,
}

pub struct BookingFlow {
    engine: Arc<Engine>,
    student_id: Ulid,
    filters: Option<Filters>,
    slots: Vec<Slot>,
    selection: Option<Selection>,
}

impl BookingFlow {
    pub fn new(engine: Arc<Engine>, student_id: Ulid) -> Self {
        Self {
            engine,
            student_id,
            filters: None,
            slots: Vec::new(),
            selection: None,
        }
    }

    pub fn filters(&self) -> Option<Filters> {
        self.filters
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Message for an empty slot list under the current filters.
    pub fn availability_message(&self) -> Option<&'static str> {
        (self.filters.is_some() && self.slots.is_empty())
            .then(|| FailureKind::NoAvailability.user_message(self.engine.tenant().locale))
    }

    /// Student-facing text for a failed select or confirm.
    pub fn error_message(&self, err: &BookingError) -> &'static str {
        err.user_message(self.engine.tenant().locale)
    }

    /// New filters drop the held slot and show fresh availability.
    pub async fn set_filters(&mut self, filters: Filters) -> Result<&[Slot], EngineError> {
        self.release_selection().await;
        self.filters = Some(filters);
        self.refresh().await?;
        Ok(&self.slots)
    }

    /// Recompute the displayed slots. No-op before any filters are set.
    pub async fn refresh(&mut self) -> Result<(), EngineError> {
        let Some(f) = self.filters else {
            self.slots.clear();
            return Ok(());
        };
        self.slots = self
            .engine
            .compute_slots(f.instructor_id, f.date, f.vehicle_type)
            .await?;
        Ok(())
    }

    /// Hold `slot` for this student. Any previous hold is given back first.
    /// A lost race refreshes the slot list before reporting.
    pub async fn select(&mut self, slot: Slot) -> Result<LockEntry, BookingError> {
        self.release_selection().await;
        let key = LockKey::for_slot(&self.engine.tenant().id, &slot);
        match self.engine.locks().acquire(&key).await? {
            Acquire::Granted(entry) => {
                self.selection = Some(Selection {
                    slot,
                    token: entry.token,
                    expires_at: entry.expires_at,
                });
                Ok(entry)
            }
            Acquire::Denied => {
                if let Err(e) = self.refresh().await {
                    warn!(student = %self.student_id, "slot refresh after denied lock failed: {e}");
                }
                Err(BookingError::SlotNoLongerAvailable)
            }
        }
    }

    /// Confirm the held slot. `Ok(None)` when nothing is selected.
    ///
    /// Business rejections keep the selection so the student can retry or top
    /// up credits; anything else gives the lock back and clears it.
    pub async fn confirm(&mut self) -> Result<Option<Booking>, BookingError> {
        let Some(selection) = self.selection else {
            debug!(student = %self.student_id, "confirm with nothing selected");
            return Ok(None);
        };
        match self
            .engine
            .confirm_booking(self.student_id, &selection.slot, selection.token)
            .await
        {
            Ok(booking) => {
                self.selection = None;
                if let Err(e) = self.refresh().await {
                    warn!(student = %self.student_id, "slot refresh after confirm failed: {e}");
                }
                Ok(Some(booking))
            }
            Err(e) if e.keeps_selection() => Err(e),
            Err(e) => {
                self.release_selection().await;
                Err(e)
            }
        }
    }

    /// Leave the flow, giving back any held slot.
    pub async fn abandon(mut self) {
        self.release_selection().await;
    }

    async fn release_selection(&mut self) {
        let Some(selection) = self.selection.take() else {
            return;
        };
        let key = LockKey::for_slot(&self.engine.tenant().id, &selection.slot);
        if let Err(e) = self.engine.locks().release(&key, selection.token).await {
            warn!(student = %self.student_id, "lock release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::ReservationLockManager;
    use crate::model::VehicleStatus;
    use crate::notify::NotifyHub;
    use crate::tenant::{Locale, TenantContext};
    use chrono::NaiveTime;
    use std::path::PathBuf;

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_flow");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    struct Setup {
        engine: Arc<Engine>,
        filters: Filters,
        student: Ulid,
    }

    async fn setup(name: &str, credits: u32, ctx: TenantContext) -> Setup {
        let engine = Arc::new(
            Engine::new(
                ctx,
                wal_path(name),
                Arc::new(NotifyHub::new()),
                Arc::new(ReservationLockManager::in_memory()),
            )
            .unwrap(),
        );
        let instructor = Ulid::new();
        let student = Ulid::new();
        engine.add_rule(Ulid::new(), instructor, 1, t(9), t(12), None).await.unwrap();
        engine
            .upsert_vehicle(Ulid::new(), VehicleType::Manual, VehicleStatus::Active, None, None, None)
            .await
            .unwrap();
        engine.upsert_student(student, credits, None).await.unwrap();
        Setup {
            engine,
            filters: Filters {
                instructor_id: instructor,
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                vehicle_type: VehicleType::Manual,
            },
            student,
        }
    }

    async fn lock_is_free(engine: &Engine, slot: &Slot) -> bool {
        let key = LockKey::for_slot(&engine.tenant().id, slot);
        match engine.locks().acquire(&key).await.unwrap() {
            Acquire::Granted(entry) => {
                engine.locks().release(&key, entry.token).await.unwrap();
                true
            }
            Acquire::Denied => false,
        }
    }

    #[tokio::test]
    async fn happy_path() {
        let s = setup("happy.wal", 2, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);

        let slots = flow.set_filters(s.filters).await.unwrap().to_vec();
        assert_eq!(slots.len(), 3);
        flow.select(slots[1]).await.unwrap();

        let booking = flow.confirm().await.unwrap().unwrap();
        assert_eq!(booking.span, slots[1].span);
        assert!(flow.selection().is_none());
        assert_eq!(flow.slots().len(), 2);
        assert_eq!(s.engine.student_credits(s.student).await, Some(1));
        assert!(lock_is_free(&s.engine, &slots[1]).await);
    }

    #[tokio::test]
    async fn confirm_without_selection_is_noop() {
        let s = setup("noop.wal", 1, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);
        assert!(flow.confirm().await.unwrap().is_none());
        flow.set_filters(s.filters).await.unwrap();
        assert!(flow.confirm().await.unwrap().is_none());
        assert!(s.engine.list_bookings().is_empty());
    }

    #[tokio::test]
    async fn reselect_releases_previous_lock() {
        let s = setup("reselect.wal", 1, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);
        let slots = flow.set_filters(s.filters).await.unwrap().to_vec();

        flow.select(slots[0]).await.unwrap();
        flow.select(slots[2]).await.unwrap();
        assert!(lock_is_free(&s.engine, &slots[0]).await);
        assert!(!lock_is_free(&s.engine, &slots[2]).await);
        assert_eq!(flow.selection().unwrap().slot, slots[2]);
    }

    #[tokio::test]
    async fn filter_change_releases_lock() {
        let s = setup("filters.wal", 1, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);
        let slots = flow.set_filters(s.filters).await.unwrap().to_vec();
        flow.select(slots[0]).await.unwrap();

        let automatic = Filters {
            vehicle_type: VehicleType::Automatic,
            ..s.filters
        };
        assert!(flow.set_filters(automatic).await.unwrap().is_empty());
        assert!(flow.selection().is_none());
        assert!(lock_is_free(&s.engine, &slots[0]).await);
        assert!(flow.availability_message().is_some());
    }

    #[tokio::test]
    async fn denied_select_refreshes_and_reports() {
        let s = setup("denied.wal", 1, TenantContext::new("school")).await;
        let mut alice = BookingFlow::new(s.engine.clone(), s.student);
        let mut bob = BookingFlow::new(s.engine.clone(), Ulid::new());
        let slots = alice.set_filters(s.filters).await.unwrap().to_vec();
        bob.set_filters(s.filters).await.unwrap();

        alice.select(slots[0]).await.unwrap();
        let err = bob.select(slots[0]).await.unwrap_err();
        assert!(matches!(err, BookingError::SlotNoLongerAvailable));
        assert!(bob.selection().is_none());
        assert_eq!(bob.slots().len(), 3);
    }

    #[tokio::test]
    async fn insufficient_credits_keeps_selection() {
        let s = setup("broke.wal", 0, TenantContext::new("school").with_locale(Locale::En)).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);
        let slots = flow.set_filters(s.filters).await.unwrap().to_vec();
        flow.select(slots[0]).await.unwrap();

        let err = flow.confirm().await.unwrap_err();
        assert!(matches!(err, BookingError::InsufficientCredits { .. }));
        assert_eq!(flow.error_message(&err), "Insufficient credits.");
        assert_eq!(flow.selection().unwrap().slot, slots[0]);
        assert!(!lock_is_free(&s.engine, &slots[0]).await);

        s.engine.upsert_student(s.student, 1, None).await.unwrap();
        assert!(flow.confirm().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persistence_failure_clears_selection() {
        let s = setup("unknown_student.wal", 1, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), Ulid::new());
        let slots = flow.set_filters(s.filters).await.unwrap().to_vec();
        flow.select(slots[0]).await.unwrap();

        let err = flow.confirm().await.unwrap_err();
        assert!(matches!(err, BookingError::PersistenceFailure(_)));
        assert!(flow.selection().is_none());
        assert!(lock_is_free(&s.engine, &slots[0]).await);
    }

    #[tokio::test]
    async fn abandon_gives_lock_back() {
        let s = setup("abandon.wal", 1, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);
        let slots = flow.set_filters(s.filters).await.unwrap().to_vec();
        flow.select(slots[1]).await.unwrap();
        flow.abandon().await;
        assert!(lock_is_free(&s.engine, &slots[1]).await);
    }

    #[tokio::test]
    async fn empty_day_message_is_localised() {
        let s = setup("empty.wal", 1, TenantContext::new("school")).await;
        let mut flow = BookingFlow::new(s.engine.clone(), s.student);
        assert!(flow.availability_message().is_none());
        let tuesday = Filters {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            ..s.filters
        };
        flow.set_filters(tuesday).await.unwrap();
        assert_eq!(
            flow.availability_message(),
            Some("No hay horarios disponibles para este día.")
        );
    }
}
