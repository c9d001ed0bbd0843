use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RULES_PER_INSTRUCTOR_DAY: usize = 48;
pub const MAX_VEHICLES_PER_TENANT: usize = 10_000;
pub const MAX_STUDENTS_PER_TENANT: usize = 1_000_000;

/// Plate, model and other short descriptive strings.
pub const MAX_LABEL_LEN: usize = 64;
/// Cancellation reasons and instructor notes.
pub const MAX_NOTE_LEN: usize = 4096;

pub const MAX_CREDITS: u32 = 100_000;

/// 1970-01-01 .. 2100-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A lesson never spans more than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;
