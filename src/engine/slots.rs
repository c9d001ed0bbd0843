use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::tenant::Timezone;

use super::conflict::{first_free_vehicle, VehicleFit};

/// Bookable one-hour slots for one instructor on one local date.
///
/// `rules` must be the instructor's rules for the date's weekday, ordered by
/// start time. `instructor_busy` and `fleet` are snapshots of the instructor's
/// timeline and of each active vehicle of the class; only active reservations
/// in them block.
///
/// Each rule is walked on its own from its start time in one-hour steps and a
/// trailing partial step is dropped. Overlapping rules therefore produce the
/// same slot twice.
pub fn allocate_slots(
    instructor_id: Ulid,
    vehicle_type: VehicleType,
    date: NaiveDate,
    timezone: Timezone,
    rules: &[AvailabilityRule],
    instructor_busy: &Timeline,
    fleet: &[Timeline],
) -> Vec<Slot> {
    if rules.is_empty() || fleet.is_empty() {
        return Vec::new();
    }

    let mut slots = Vec::new();
    for rule in rules {
        let (Some(mut cursor), Some(window_end)) = (
            timezone.instant(date, rule.start_time),
            timezone.instant(date, rule.end_time),
        ) else {
            continue;
        };
        while cursor + LESSON_MS <= window_end {
            let candidate = Span::new(cursor, cursor + LESSON_MS);
            let instructor_free = instructor_busy.first_conflict(&candidate).is_none();
            if instructor_free && matches!(first_free_vehicle(fleet, &candidate), VehicleFit::Free(_)) {
                slots.push(Slot {
                    instructor_id,
                    span: candidate,
                    vehicle_type,
                });
            }
            cursor += LESSON_MS;
        }
    }
    slots
}

/// Whether `span` is one of the one-hour steps `allocate_slots` walks for
/// `rules` on the tenant-local `date`.
pub(crate) fn is_rule_step(span: &Span, date: NaiveDate, timezone: Timezone, rules: &[AvailabilityRule]) -> bool {
    if span.duration_ms() != LESSON_MS {
        return false;
    }
    rules.iter().any(|rule| {
        let (Some(open), Some(close)) = (
            timezone.instant(date, rule.start_time),
            timezone.instant(date, rule.end_time),
        ) else {
            return false;
        };
        span.start >= open && span.end <= close && (span.start - open) % LESSON_MS == 0
    })
}
