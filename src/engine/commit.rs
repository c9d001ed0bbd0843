use std::time::Instant;

use chrono::Datelike;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::locks::{LockKey, LockToken};
use crate::model::*;
use crate::notify::BookingConfirmed;

use super::conflict::{first_free_vehicle, now_ms, validate_span, VehicleFit};
use super::slots::is_rule_step;
use super::{apply_booking, BookingError, Engine, EngineError};

/// Staged writes of one confirm, over rows whose write guards the caller holds.
/// Nothing reaches the WAL or the rows until `commit`; dropping it discards
/// the staged booking and debit.
struct Txn<'g> {
    instructor: &'g mut Timeline,
    vehicle: &'g mut Timeline,
    student: &'g mut Student,
    booking: Option<Booking>,
    debit: Option<u32>,
}

impl<'g> Txn<'g> {
    fn begin(instructor: &'g mut Timeline, vehicle: &'g mut Timeline, student: &'g mut Student) -> Self {
        Self {
            instructor,
            vehicle,
            student,
            booking: None,
            debit: None,
        }
    }

    fn insert(&mut self, booking: Booking) {
        self.booking = Some(booking);
    }

    fn debit(&mut self, amount: u32) -> Result<(), BookingError> {
        let balance = self.student.credits;
        if balance.checked_sub(amount).is_none() {
            return Err(BookingError::InsufficientCredits { balance, cost: amount });
        }
        self.debit = Some(amount);
        Ok(())
    }

    /// One WAL record for insert + debit, then apply both to the guarded rows.
    async fn commit(self, engine: &Engine) -> Result<Booking, BookingError> {
        let (Some(booking), Some(debited)) = (self.booking, self.debit) else {
            return Err(BookingError::PersistenceFailure("incomplete transaction".into()));
        };
        let event = Event::BookingCommitted {
            booking: booking.clone(),
            debited,
        };
        engine.wal_append(&event).await?;
        apply_booking(
            &engine.store,
            &booking,
            self.instructor,
            Some(self.vehicle),
            Some(self.student),
            debited,
        );
        Ok(booking)
    }
}

impl Engine {
    pub async fn confirm_booking(
        &self,
        student_id: Ulid,
        slot: &Slot,
        token: LockToken,
    ) -> Result<Booking, BookingError> {
        self.confirm(student_id, slot, token, None).await
    }

    /// As `confirm_booking`, judging lock expiry at `now` instead of the
    /// clock at the time the row locks are held.
    pub async fn confirm_booking_at(
        &self,
        student_id: Ulid,
        slot: &Slot,
        token: LockToken,
        now: Ms,
    ) -> Result<Booking, BookingError> {
        self.confirm(student_id, slot, token, Some(now)).await
    }

    /// Turn a locked slot into a CONFIRMED booking and charge the student.
    ///
    /// On error nothing was written: no booking row and the balance unchanged.
    /// The reservation lock is consumed only on success.
    async fn confirm(
        &self,
        student_id: Ulid,
        slot: &Slot,
        token: LockToken,
        now: Option<Ms>,
    ) -> Result<Booking, BookingError> {
        let started = Instant::now();
        let result = self.try_confirm(student_id, slot, token, now).await;

        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(e) => e.kind().label(),
        };
        metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(crate::observability::COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                let key = LockKey::for_slot(&self.tenant.id, slot);
                match self.locks.release(&key, token).await {
                    Ok(true) => {}
                    Ok(false) => warn!(booking = %booking.id, "lock already gone at release"),
                    Err(e) => warn!(booking = %booking.id, "lock release failed: {e}"),
                }
                info!(
                    tenant = %self.tenant.id,
                    booking = %booking.id,
                    student = %student_id,
                    instructor = %slot.instructor_id,
                    "booking confirmed"
                );
                let event = BookingConfirmed::from_booking(booking);
                match event.to_json() {
                    Ok(payload) => debug!(%payload, "booking-confirmed"),
                    Err(e) => warn!(booking = %booking.id, "event encoding failed: {e}"),
                }
                self.notify.booking_confirmed(event);
            }
            Err(BookingError::PersistenceFailure(detail)) => {
                error!(tenant = %self.tenant.id, student = %student_id, "confirm failed: {detail}");
            }
            Err(e) => debug!(tenant = %self.tenant.id, student = %student_id, "confirm rejected: {e}"),
        }
        result
    }

    async fn try_confirm(
        &self,
        student_id: Ulid,
        slot: &Slot,
        token: LockToken,
        now: Option<Ms>,
    ) -> Result<Booking, BookingError> {
        validate_span(&slot.span)?;
        let key = LockKey::for_slot(&self.tenant.id, slot);
        let tenant = &self.tenant.id;

        let _gate = self.write_gate.read().await;

        // Row locks in global order: instructor, vehicles by ascending id, student.
        let mut instructor = self
            .store
            .instructor_timeline(slot.instructor_id)
            .write_owned()
            .await;
        let candidates = self.store.vehicles_serving(tenant, slot.vehicle_type);
        let mut fleet: Vec<(Ulid, OwnedRwLockWriteGuard<Timeline>)> = Vec::with_capacity(candidates.len());
        for v in &candidates {
            let guard = self.store.vehicle_timeline(v.id).write_owned().await;
            fleet.push((v.id, guard));
        }
        // Status may have changed between listing and locking.
        fleet.retain(|(id, _)| {
            self.store
                .vehicle(tenant, *id)
                .is_some_and(|v| v.serves(slot.vehicle_type))
        });
        let student_row = self
            .store
            .student(tenant, student_id)
            .await
            .ok_or(EngineError::NotFound(student_id))?;
        let mut student = student_row.write_owned().await;

        // Expiry is judged once every row is held: waiting for them counts.
        let now = now.unwrap_or_else(now_ms);
        if !self.locks.is_valid_at(&key, token, now).await? {
            return Err(BookingError::SlotNoLongerAvailable);
        }
        if !self.is_bookable_step(slot) {
            return Err(BookingError::SlotNoLongerAvailable);
        }
        if student.credits < LESSON_CREDITS {
            return Err(BookingError::InsufficientCredits {
                balance: student.credits,
                cost: LESSON_CREDITS,
            });
        }
        if let Some(r) = instructor.first_conflict(&slot.span) {
            return Err(BookingError::ConflictingBooking(r.booking_id));
        }
        let idx = match first_free_vehicle(fleet.iter().map(|(_, g)| &**g), &slot.span) {
            VehicleFit::Free(idx) => idx,
            VehicleFit::Exhausted(blocker) => return Err(BookingError::ConflictingBooking(blocker)),
            VehicleFit::NoFleet => return Err(BookingError::SlotNoLongerAvailable),
        };
        let (vehicle_id, vehicle) = &mut fleet[idx];

        let booking = Booking {
            id: Ulid::new(),
            tenant_id: tenant.clone(),
            student_id,
            instructor_id: slot.instructor_id,
            vehicle_id: Some(*vehicle_id),
            span: slot.span,
            status: BookingStatus::Confirmed,
            credits_cost: LESSON_CREDITS,
            cancellation_reason: None,
            cancelled_at: None,
            completed_at: None,
            instructor_notes: None,
        };

        let mut txn = Txn::begin(&mut instructor, vehicle, &mut student);
        txn.insert(booking);
        #[cfg(test)]
        if self.fail_before_debit.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BookingError::PersistenceFailure("injected fault before debit".into()));
        }
        txn.debit(LESSON_CREDITS)?;
        txn.commit(self).await
    }

    /// The slot is a one-hour step of one of the instructor's live rules.
    fn is_bookable_step(&self, slot: &Slot) -> bool {
        let tz = self.tenant.timezone;
        let Some(local) = tz.to_local(slot.span.start) else {
            return false;
        };
        let weekday = local.weekday().num_days_from_sunday() as u8;
        let rules = self.store.rules_for(&self.tenant.id, slot.instructor_id, weekday);
        is_rule_step(&slot.span, local.date_naive(), tz, &rules)
    }
}
