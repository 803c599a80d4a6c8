use crate::model::Minute;

pub const MAX_BUSINESSES: usize = 10_000;
pub const MAX_STAFF_PER_BUSINESS: usize = 500;
pub const MAX_SERVICES_PER_BUSINESS: usize = 1_000;
pub const MAX_TIME_OFFS_PER_BUSINESS: usize = 10_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 500;

/// A single booking or window never spans more than one day.
pub const MAX_DURATION_MINUTES: Minute = 24 * 60;
pub const MIN_GRANULARITY_MINUTES: Minute = 5;
pub const MAX_GRANULARITY_MINUTES: Minute = 240;

/// Calendar years a booking, slot query or time-off block may fall in.
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 9999;

/// Longest time-off block accepted, in days.
pub const MAX_TIME_OFF_DAYS: i64 = 366;

/// Non-cancelled bookings a single (business, staff, date) lane may hold.
pub const MAX_BOOKINGS_PER_LANE: usize = 1_440;
