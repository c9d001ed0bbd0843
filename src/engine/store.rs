use std::sync::Arc;

use chrono::NaiveTime;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedTimeline = Arc<RwLock<Timeline>>;
pub type SharedStudent = Arc<RwLock<Student>>;

/// Rows arriving without a tenant take the ambient one; any other tenant is refused.
pub(crate) fn stamp_tenant(ambient: &TenantId, explicit: Option<TenantId>) -> Result<TenantId, EngineError> {
    match explicit {
        None => Ok(ambient.clone()),
        Some(given) if &given == ambient => Ok(given),
        Some(given) => Err(EngineError::TenantMismatch {
            ambient: ambient.clone(),
            given,
        }),
    }
}

/// Tenant-scoped data access. Every scoped read takes the ambient tenant and
/// only ever returns rows stamped with it; `unscoped_*` methods are the sole
/// way around the filter.
///
/// Instructor and vehicle timelines double as row locks: commits take their
/// write guards (plus the student's) before re-validating.
#[derive(Default)]
pub struct Store {
    /// (instructor, weekday) → rules sorted by start_time.
    rules: DashMap<(Ulid, u8), Vec<AvailabilityRule>>,
    rule_keys: DashMap<Ulid, (Ulid, u8)>,
    vehicles: DashMap<Ulid, Vehicle>,
    vehicle_timelines: DashMap<Ulid, SharedTimeline>,
    instructor_timelines: DashMap<Ulid, SharedTimeline>,
    students: DashMap<Ulid, SharedStudent>,
    bookings: DashMap<Ulid, Booking>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Availability rules ───────────────────────────────────

    pub fn rules_for(&self, tenant: &TenantId, instructor_id: Ulid, weekday: u8) -> Vec<AvailabilityRule> {
        self.rules
            .get(&(instructor_id, weekday))
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| &r.tenant_id == tenant)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rule(&self, tenant: &TenantId, id: Ulid) -> Option<AvailabilityRule> {
        let key = *self.rule_keys.get(&id)?;
        let rules = self.rules.get(&key)?;
        rules
            .iter()
            .find(|r| r.id == id && &r.tenant_id == tenant)
            .cloned()
    }

    pub fn rule_count(&self, instructor_id: Ulid, weekday: u8) -> usize {
        self.rules
            .get(&(instructor_id, weekday))
            .map_or(0, |rules| rules.len())
    }

    pub fn insert_rule(&self, rule: AvailabilityRule) {
        self.remove_rule(rule.id);
        let key = (rule.instructor_id, rule.day_of_week);
        self.rule_keys.insert(rule.id, key);
        let mut rules = self.rules.entry(key).or_default();
        let pos = rules
            .binary_search_by_key(&rule.start_time, |r| r.start_time)
            .map(|p| p + 1)
            .unwrap_or_else(|e| e);
        rules.insert(pos, rule);
    }

    pub fn remove_rule(&self, id: Ulid) -> Option<AvailabilityRule> {
        let (_, key) = self.rule_keys.remove(&id)?;
        let mut rules = self.rules.get_mut(&key)?;
        let pos = rules.iter().position(|r| r.id == id)?;
        Some(rules.remove(pos))
    }

    pub fn rule_key(&self, id: Ulid) -> Option<(Ulid, u8)> {
        self.rule_keys.get(&id).map(|k| *k)
    }

    // ── Fleet ────────────────────────────────────────────────

    pub fn vehicle(&self, tenant: &TenantId, id: Ulid) -> Option<Vehicle> {
        self.vehicles
            .get(&id)
            .filter(|v| &v.tenant_id == tenant)
            .map(|v| v.clone())
    }

    /// Active vehicles of the class, ascending id.
    pub fn vehicles_serving(&self, tenant: &TenantId, vehicle_type: VehicleType) -> Vec<Vehicle> {
        let mut vehicles: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|v| &v.tenant_id == tenant && v.serves(vehicle_type))
            .map(|v| v.value().clone())
            .collect();
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn upsert_vehicle(&self, vehicle: Vehicle) {
        self.vehicle_timelines.entry(vehicle.id).or_default();
        self.vehicles.insert(vehicle.id, vehicle);
    }

    pub fn vehicle_timeline(&self, id: Ulid) -> SharedTimeline {
        self.vehicle_timelines.entry(id).or_default().value().clone()
    }

    // ── Instructors ──────────────────────────────────────────

    /// Existing timeline only; queries never create rows.
    pub fn find_instructor_timeline(&self, instructor_id: Ulid) -> Option<SharedTimeline> {
        self.instructor_timelines
            .get(&instructor_id)
            .map(|t| t.value().clone())
    }

    pub fn instructor_timeline(&self, instructor_id: Ulid) -> SharedTimeline {
        self.instructor_timelines
            .entry(instructor_id)
            .or_default()
            .value()
            .clone()
    }

    // ── Students ─────────────────────────────────────────────

    pub async fn student(&self, tenant: &TenantId, id: Ulid) -> Option<SharedStudent> {
        let shared = self.students.get(&id).map(|s| s.value().clone())?;
        let owned_by_tenant = &shared.read().await.tenant_id == tenant;
        owned_by_tenant.then_some(shared)
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    pub fn shared_student(&self, id: Ulid) -> Option<SharedStudent> {
        self.students.get(&id).map(|s| s.value().clone())
    }

    pub fn insert_student(&self, student: Student) -> SharedStudent {
        let shared = Arc::new(RwLock::new(student.clone()));
        self.students.insert(student.id, shared.clone());
        shared
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking(&self, tenant: &TenantId, id: Ulid) -> Option<Booking> {
        self.bookings
            .get(&id)
            .filter(|b| &b.tenant_id == tenant)
            .map(|b| b.clone())
    }

    /// All of the tenant's bookings, chronological.
    pub fn bookings(&self, tenant: &TenantId) -> Vec<Booking> {
        self.collect_bookings(|b| &b.tenant_id == tenant)
    }

    pub fn bookings_for_student(&self, tenant: &TenantId, student_id: Ulid) -> Vec<Booking> {
        self.collect_bookings(|b| &b.tenant_id == tenant && b.student_id == student_id)
    }

    pub fn unscoped_bookings(&self) -> Vec<Booking> {
        self.collect_bookings(|_| true)
    }

    fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| keep(b.value()))
            .map(|b| b.value().clone())
            .collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub fn insert_booking(&self, booking: Booking) {
        self.bookings.insert(booking.id, booking);
    }

    pub fn update_booking(&self, id: Ulid, f: impl FnOnce(&mut Booking)) -> Option<Booking> {
        let mut entry = self.bookings.get_mut(&id)?;
        f(entry.value_mut());
        Some(entry.value().clone())
    }

    // ── Snapshot (compaction) ────────────────────────────────

    pub fn snapshot_rules(&self) -> Vec<AvailabilityRule> {
        let mut rules: Vec<AvailabilityRule> = self
            .rules
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        rules.sort_by_key(|r| (r.instructor_id, r.day_of_week, r.start_time, r.id));
        rules
    }

    pub fn snapshot_vehicles(&self) -> Vec<Vehicle> {
        let mut vehicles: Vec<Vehicle> = self.vehicles.iter().map(|v| v.value().clone()).collect();
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    pub fn snapshot_students(&self) -> Vec<SharedStudent> {
        self.students.iter().map(|s| s.value().clone()).collect()
    }
}

/// Rules must describe a real forward window on a real weekday.
pub(crate) fn validate_rule(day_of_week: u8, start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if day_of_week > 6 {
        return Err(EngineError::InvalidRule("day_of_week must be 0 (Sunday) to 6 (Saturday)"));
    }
    if start >= end {
        return Err(EngineError::InvalidRule("start_time must be before end_time"));
    }
    Ok(())
}
