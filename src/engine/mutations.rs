use chrono::NaiveTime;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::store::{stamp_tenant, validate_rule};
use super::{apply_transition, Engine, EngineError, WalCommand};

fn check_label(value: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    if value.as_ref().is_some_and(|v| v.len() > MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    pub async fn add_rule(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        tenant: Option<TenantId>,
    ) -> Result<(), EngineError> {
        let tenant_id = stamp_tenant(&self.tenant.id, tenant)?;
        validate_rule(day_of_week, start_time, end_time)?;
        if self.store.rule_key(id).is_none()
            && self.store.rule_count(instructor_id, day_of_week) >= MAX_RULES_PER_INSTRUCTOR_DAY
        {
            return Err(EngineError::LimitExceeded("too many rules for instructor day"));
        }

        let _gate = self.write_gate.read().await;
        let rule = AvailabilityRule {
            id,
            tenant_id,
            instructor_id,
            day_of_week,
            start_time,
            end_time,
        };
        self.persist_and_apply(Event::RuleAdded(rule)).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.rule(&self.tenant.id, id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let _gate = self.write_gate.read().await;
        self.persist_and_apply(Event::RuleRemoved { id }).await
    }

    /// Insert or replace a fleet vehicle. Holds the vehicle's timeline while
    /// the change lands so in-flight commits see either the old or new status.
    pub async fn upsert_vehicle(
        &self,
        id: Ulid,
        vehicle_type: VehicleType,
        status: VehicleStatus,
        plate: Option<String>,
        model: Option<String>,
        tenant: Option<TenantId>,
    ) -> Result<(), EngineError> {
        let tenant_id = stamp_tenant(&self.tenant.id, tenant)?;
        check_label(&plate, "plate too long")?;
        check_label(&model, "model too long")?;
        if self.store.vehicle(&self.tenant.id, id).is_none()
            && self.store.vehicle_count() >= MAX_VEHICLES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }

        let _gate = self.write_gate.read().await;
        let timeline = self.store.vehicle_timeline(id);
        let _row = timeline.write().await;
        let vehicle = Vehicle {
            id,
            tenant_id,
            vehicle_type,
            status,
            plate,
            model,
        };
        self.persist_and_apply(Event::VehicleUpserted(vehicle)).await
    }

    /// Set a student's credit balance, creating the student if needed.
    pub async fn upsert_student(&self, id: Ulid, credits: u32, tenant: Option<TenantId>) -> Result<(), EngineError> {
        let tenant_id = stamp_tenant(&self.tenant.id, tenant)?;
        if credits > MAX_CREDITS {
            return Err(EngineError::LimitExceeded("credit balance too large"));
        }

        let _gate = self.write_gate.read().await;
        let student = Student { id, tenant_id, credits };
        match self.store.shared_student(id) {
            Some(shared) => {
                let mut row = shared.write().await;
                if row.tenant_id != self.tenant.id {
                    return Err(EngineError::NotFound(id));
                }
                self.wal_append(&Event::StudentUpserted(student.clone())).await?;
                *row = student;
            }
            None => {
                if self.store.student_count() >= MAX_STUDENTS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many students"));
                }
                self.wal_append(&Event::StudentUpserted(student.clone())).await?;
                self.store.insert_student(student);
            }
        }
        Ok(())
    }

    /// Move a booking along its lifecycle. `note` becomes the cancellation
    /// reason or the instructor's completion notes. Credits are not refunded.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        target: BookingStatus,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let current = self
            .store
            .booking(&self.tenant.id, id)
            .ok_or(EngineError::NotFound(id))?;

        let _gate = self.write_gate.read().await;
        let mut instructor = self
            .store
            .instructor_timeline(current.instructor_id)
            .write_owned()
            .await;
        let mut vehicle = match current.vehicle_id {
            Some(v) => Some(self.store.vehicle_timeline(v).write_owned().await),
            None => None,
        };

        // Re-read under the row locks.
        let from = self
            .store
            .booking(&self.tenant.id, id)
            .ok_or(EngineError::NotFound(id))?
            .status;
        if !from.can_transition_to(target) {
            return Err(EngineError::IllegalTransition { from, to: target });
        }

        let at = now_ms();
        let event = Event::BookingTransitioned {
            id,
            status: target,
            at,
            note: note.clone(),
        };
        self.wal_append(&event).await?;
        let updated = apply_transition(
            &self.store,
            id,
            target,
            at,
            note,
            &mut instructor,
            vehicle.as_deref_mut(),
        )
        .ok_or(EngineError::NotFound(id))?;
        info!(tenant = %self.tenant.id, booking = %id, status = target.as_str(), "booking transitioned");
        Ok(updated)
    }

    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled, reason).await
    }

    pub async fn check_in(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::CheckIn, None).await
    }

    pub async fn complete_booking(&self, id: Ulid, notes: Option<String>) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Completed, notes).await
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.store.snapshot_rules().into_iter().map(Event::RuleAdded));
        events.extend(self.store.snapshot_vehicles().into_iter().map(Event::VehicleUpserted));
        let mut students = Vec::new();
        for shared in self.store.snapshot_students() {
            students.push(shared.read().await.clone());
        }
        students.sort_by_key(|s| s.id);
        events.extend(students.into_iter().map(Event::StudentUpserted));
        events.extend(self.store.unscoped_bookings().into_iter().map(Event::BookingRestored));

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
