use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Every lesson lasts exactly one hour.
pub const LESSON_MS: Ms = 3_600_000;

/// Credits charged per lesson.
pub const LESSON_CREDITS: u32 = 1;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Opaque tenant (driving school) identifier. Stamped on every row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Fleet ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleType {
    Manual,
    Automatic,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Manual => "manual",
            VehicleType::Automatic => "automatic",
        }
    }
}

impl FromStr for VehicleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(VehicleType::Manual),
            "automatic" => Ok(VehicleType::Automatic),
            other => Err(format!("unknown vehicle type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleStatus {
    Active,
    Maintenance,
    Inactive,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Active => "active",
            VehicleStatus::Maintenance => "maintenance",
            VehicleStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for VehicleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(VehicleStatus::Active),
            "maintenance" => Ok(VehicleStatus::Maintenance),
            "inactive" => Ok(VehicleStatus::Inactive),
            other => Err(format!("unknown vehicle status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub vehicle_type: VehicleType,
    pub status: VehicleStatus,
    pub plate: Option<String>,
    pub model: Option<String>,
}

impl Vehicle {
    /// Whether this vehicle can be handed out for a lesson of the given class.
    pub fn serves(&self, vehicle_type: VehicleType) -> bool {
        self.status == VehicleStatus::Active && self.vehicle_type == vehicle_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub credits: u32,
}

// ── Availability ─────────────────────────────────────────────────

/// Recurring weekly window during which an instructor teaches.
/// Times are wall-clock times in the tenant's timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub instructor_id: Ulid,
    /// 0 = Sunday .. 6 = Saturday
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Draft,
    Confirmed,
    CheckIn,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings occupy their instructor and vehicle.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::CheckIn)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Draft, Confirmed)
                | (Draft, Cancelled)
                | (Confirmed, CheckIn)
                | (Confirmed, Cancelled)
                | (CheckIn, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Draft => "DRAFT",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::CheckIn => "CHECK_IN",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(BookingStatus::Draft),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CHECK_IN" => Ok(BookingStatus::CheckIn),
            "COMPLETED" => Ok(BookingStatus::Completed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub student_id: Ulid,
    pub instructor_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub credits_cost: u32,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub instructor_notes: Option<String>,
}

/// A bookable one-hour lesson window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub instructor_id: Ulid,
    pub span: Span,
    pub vehicle_type: VehicleType,
}

// ── Per-row occupancy ────────────────────────────────────────────

/// A booking as seen from an instructor's or vehicle's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub booking_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
}

/// Active reservations on one instructor or vehicle, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub reservations: Vec<Reservation>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.booking_id == booking_id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn set_status(&mut self, booking_id: Ulid, status: BookingStatus) {
        if let Some(r) = self.reservations.iter_mut().find(|r| r.booking_id == booking_id) {
            r.status = status;
        }
    }

    /// Reservations whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// First active reservation that blocks `span`, if any.
    pub fn first_conflict(&self, span: &Span) -> Option<&Reservation> {
        self.overlapping(span).find(|r| r.status.is_active())
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RuleAdded(AvailabilityRule),
    RuleRemoved {
        id: Ulid,
    },
    VehicleUpserted(Vehicle),
    StudentUpserted(Student),
    /// Booking insert and credit debit land in one record so replay can never split them.
    BookingCommitted {
        booking: Booking,
        debited: u32,
    },
    /// Written by compaction: the booking row without touching any balance.
    BookingRestored(Booking),
    BookingTransitioned {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        note: Option<String>,
    },
}

impl Event {
    /// Owning tenant of records that carry a whole row. Removals and
    /// transitions address rows by id only.
    pub fn tenant_id(&self) -> Option<&TenantId> {
        match self {
            Event::RuleAdded(rule) => Some(&rule.tenant_id),
            Event::VehicleUpserted(vehicle) => Some(&vehicle.tenant_id),
            Event::StudentUpserted(student) => Some(&student.tenant_id),
            Event::BookingCommitted { booking, .. } | Event::BookingRestored(booking) => Some(&booking.tenant_id),
            Event::RuleRemoved { .. } | Event::BookingTransitioned { .. } => None,
        }
    }
}
