use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::slots::allocate_slots;
use super::{Engine, EngineError};

/// Copy of the active reservations in `timeline` that touch `window`.
fn day_snapshot(timeline: &Timeline, window: &Span) -> Timeline {
    let mut snapshot = Timeline::new();
    for r in timeline.overlapping(window).filter(|r| r.status.is_active()) {
        snapshot.insert(*r);
    }
    snapshot
}

impl Engine {
    /// Bookable slots for `instructor_id` on the tenant-local `date`.
    ///
    /// Read-only and never blocks on reservation locks. Each row is read under
    /// its own short read guard, so the result is a point-in-time view that a
    /// commit may later invalidate.
    pub async fn compute_slots(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        vehicle_type: VehicleType,
    ) -> Result<Vec<Slot>, EngineError> {
        let tz = self.tenant.timezone;
        let day = tz.day_span(date).ok_or(EngineError::LimitExceeded("date out of range"))?;
        let weekday = date.weekday().num_days_from_sunday() as u8;

        let rules = self.store.rules_for(&self.tenant.id, instructor_id, weekday);
        if rules.is_empty() {
            metrics::counter!(crate::observability::SLOTS_COMPUTED_TOTAL).increment(1);
            return Ok(Vec::new());
        }

        let instructor_busy = match self.store.find_instructor_timeline(instructor_id) {
            Some(tl) => day_snapshot(&*tl.read().await, &day),
            None => Timeline::new(),
        };

        let vehicles = self.store.vehicles_serving(&self.tenant.id, vehicle_type);
        let mut fleet = Vec::with_capacity(vehicles.len());
        for v in &vehicles {
            let tl = self.store.vehicle_timeline(v.id);
            fleet.push(day_snapshot(&*tl.read().await, &day));
        }

        let slots = allocate_slots(
            instructor_id,
            vehicle_type,
            date,
            tz,
            &rules,
            &instructor_busy,
            &fleet,
        );
        metrics::counter!(crate::observability::SLOTS_COMPUTED_TOTAL).increment(1);
        Ok(slots)
    }

    pub fn get_booking(&self, id: Ulid) -> Option<Booking> {
        self.store.booking(&self.tenant.id, id)
    }

    pub fn list_bookings(&self) -> Vec<Booking> {
        self.store.bookings(&self.tenant.id)
    }

    pub fn bookings_for_student(&self, student_id: Ulid) -> Vec<Booking> {
        self.store.bookings_for_student(&self.tenant.id, student_id)
    }

    /// Bookings of every tenant this engine has ever seen. Admin tooling only.
    pub fn unscoped_bookings(&self) -> Vec<Booking> {
        self.store.unscoped_bookings()
    }

    pub async fn student_credits(&self, student_id: Ulid) -> Option<u32> {
        let student = self.store.student(&self.tenant.id, student_id).await?;
        let credits = student.read().await.credits;
        Some(credits)
    }

    pub fn get_vehicle(&self, id: Ulid) -> Option<Vehicle> {
        self.store.vehicle(&self.tenant.id, id)
    }

    pub fn get_rule(&self, id: Ulid) -> Option<AvailabilityRule> {
        self.store.rule(&self.tenant.id, id)
    }

    pub fn rules_for(&self, instructor_id: Ulid, day_of_week: u8) -> Vec<AvailabilityRule> {
        self.store.rules_for(&self.tenant.id, instructor_id, day_of_week)
    }
}
