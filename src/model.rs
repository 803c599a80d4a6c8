use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since business-local midnight.
pub type Minute = i32;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

// ── Time of day ──────────────────────────────────────────────────

/// A wall-clock time of day, exchanged as zero-padded `"HH:MM"`.
///
/// `24:00` is representable so a window or booking can end at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime(Minute);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    pub const END_OF_DAY: ClockTime = ClockTime(MINUTES_PER_DAY);

    pub fn from_minutes(minutes: Minute) -> Option<Self> {
        (0..=MINUTES_PER_DAY).contains(&minutes).then_some(Self(minutes))
    }

    pub fn hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes((hour * 60 + minute) as Minute)
    }

    pub fn minutes(self) -> Minute {
        self.0
    }

    /// Shift forward by `minutes`; `None` if the result passes 24:00.
    pub fn checked_add(self, minutes: Minute) -> Option<Self> {
        self.0.checked_add(minutes).and_then(Self::from_minutes)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?}: expected HH:MM between 00:00 and 24:00")]
pub struct ParseClockTimeError(pub String);

impl FromStr for ClockTime {
    type Err = ParseClockTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseClockTimeError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(bad());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let hour: u32 = h.parse().map_err(|_| bad())?;
        let minute: u32 = m.parse().map_err(|_| bad())?;
        ClockTime::hm(hour, minute).ok_or_else(bad)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = ParseClockTimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClockTime> for String {
    fn from(t: ClockTime) -> Self {
        t.to_string()
    }
}

/// Day of week with 0 = Sunday, matching how windows are keyed.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Local datetime of `minutes` past midnight on `date` (1440 rolls to the next day).
/// Saturates at the end of the calendar.
pub fn at_minute(date: NaiveDate, minutes: Minute) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
        .checked_add_signed(TimeDelta::minutes(minutes as i64))
        .unwrap_or(NaiveDateTime::MAX)
}

// ── Spans ────────────────────────────────────────────────────────

/// Half-open interval `[start, end)` in minutes of a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn between(start: ClockTime, end: ClockTime) -> Self {
        Self::new(start.minutes(), end.minutes())
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Catalog entities ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub slug: String,
    pub name: String,
    /// Minimum notice, in hours, for cancelling or rescheduling. `None`/0 = no cutoff.
    pub cancellation_hours: Option<u32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    /// Price in minor currency units.
    pub price: i64,
    pub sort_order: i32,
    pub is_active: bool,
    /// Staff eligible to perform this service.
    pub staff: Vec<Ulid>,
}

/// Recurring weekly open interval. `staff_id = None` is the business default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub business_id: Ulid,
    pub staff_id: Option<Ulid>,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub is_active: bool,
}

impl AvailabilityWindow {
    pub fn span(&self) -> Span {
        Span::between(self.start_time, self.end_time)
    }
}

/// One-off closure. `staff_id = None` blocks the whole business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffBlock {
    pub id: Ulid,
    pub business_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub is_all_day: bool,
    pub title: Option<String>,
}

impl TimeOffBlock {
    /// Half-open overlap with `[start, end)`.
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start < end && self.end > start
    }

    /// Portion of the block falling on `date`, in minutes of that day.
    pub fn span_on(&self, date: NaiveDate) -> Option<Span> {
        let day_start = at_minute(date, 0);
        let day_end = at_minute(date, MINUTES_PER_DAY);
        if !self.overlaps(day_start, day_end) {
            return None;
        }
        let start = self.start.max(day_start) - day_start;
        let end = self.end.min(day_end) - day_start;
        let (start, end) = (start.num_minutes() as Minute, ceil_minutes(end));
        (start < end).then(|| Span::new(start, end))
    }
}

/// Round a sub-day duration up to whole minutes so partial minutes still block.
fn ceil_minutes(d: TimeDelta) -> Minute {
    let whole = d.num_minutes();
    let rem = d - TimeDelta::minutes(whole);
    (if rem > TimeDelta::zero() { whole + 1 } else { whole }) as Minute
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    #[serde(rename = "24h")]
    DayBefore,
    #[serde(rename = "1h")]
    HourBefore,
}

impl ReminderKind {
    /// `(min, max]` hours-until-start window in which the reminder is due.
    pub fn window_hours(self) -> (i64, i64) {
        match self {
            ReminderKind::DayBefore => (23, 24),
            ReminderKind::HourBefore => (0, 1),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReminderKind::DayBefore => "24h",
            ReminderKind::HourBefore => "1h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub business_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub customer: Customer,
    pub amount: i64,
    pub payment_reference: Ulid,
    pub created_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancellation_reason: Option<String>,
    pub reminder_24h_sent_at: Option<NaiveDateTime>,
    pub reminder_1h_sent_at: Option<NaiveDateTime>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::between(self.start_time, self.end_time)
    }

    /// Cancelled bookings never take part in conflict checks.
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        at_minute(self.date, self.start_time.minutes())
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        at_minute(self.date, self.end_time.minutes())
    }

    pub fn is_past(&self, now: NaiveDateTime) -> bool {
        self.starts_at() <= now
    }

    /// Short customer-facing reference (first 8 chars, uppercase).
    pub fn short_reference(&self) -> String {
        self.payment_reference.to_string()[..8].to_uppercase()
    }

    pub fn lane_key(&self) -> LaneKey {
        LaneKey {
            day: DayKey {
                business_id: self.business_id,
                date: self.date,
            },
            lane: Lane::from(self.staff_id),
        }
    }

    pub fn reminder_sent_at(&self, kind: ReminderKind) -> Option<NaiveDateTime> {
        match kind {
            ReminderKind::DayBefore => self.reminder_24h_sent_at,
            ReminderKind::HourBefore => self.reminder_1h_sent_at,
        }
    }
}

// ── Lock regions ─────────────────────────────────────────────────

/// One business on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayKey {
    pub business_id: Ulid,
    pub date: NaiveDate,
}

/// Who a booking occupies. `Unassigned` bookings conflict with every lane of their day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lane {
    Unassigned,
    Staff(Ulid),
}

impl From<Option<Ulid>> for Lane {
    fn from(staff_id: Option<Ulid>) -> Self {
        staff_id.map_or(Lane::Unassigned, Lane::Staff)
    }
}

/// The serialization unit of the allocator: (business, staff, date).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LaneKey {
    pub day: DayKey,
    pub lane: Lane,
}

impl LaneKey {
    /// Same business and staff, another date.
    pub fn on_date(self, date: NaiveDate) -> LaneKey {
        LaneKey {
            day: DayKey {
                business_id: self.day.business_id,
                date,
            },
            lane: self.lane,
        }
    }
}

/// Bookings of one lane, sorted by start time.
#[derive(Debug, Clone)]
pub struct LaneState {
    pub key: LaneKey,
    pub bookings: Vec<Booking>,
}

impl LaneState {
    pub fn new(key: LaneKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start_time, |b| b.start_time)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Non-cancelled bookings whose span overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.start_time.minutes() < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.end_time.minutes() > query.start && b.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_active()).count()
    }
}

// ── WAL record format ────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessRegistered(Business),
    BusinessUpdated(Business),
    StaffAdded(StaffMember),
    StaffUpdated(StaffMember),
    ServiceDefined(Service),
    ServiceUpdated(Service),
    WindowSet(AvailabilityWindow),
    WindowDeactivated {
        id: Ulid,
        business_id: Ulid,
    },
    TimeOffAdded(TimeOffBlock),
    TimeOffRemoved {
        id: Ulid,
        business_id: Ulid,
    },
    BookingCreated(Booking),
    BookingRescheduled {
        id: Ulid,
        from: LaneKey,
        date: NaiveDate,
        start_time: ClockTime,
        end_time: ClockTime,
    },
    BookingCancelled {
        id: Ulid,
        lane: LaneKey,
        at: NaiveDateTime,
        reason: String,
    },
    PaymentConfirmed {
        id: Ulid,
        lane: LaneKey,
    },
    PaymentRefunded {
        id: Ulid,
        lane: LaneKey,
        at: NaiveDateTime,
    },
    ReminderSent {
        id: Ulid,
        lane: LaneKey,
        kind: ReminderKind,
        at: NaiveDateTime,
    },
}

impl Event {
    pub fn business_id(&self) -> Ulid {
        match self {
            Event::BusinessRegistered(b) | Event::BusinessUpdated(b) => b.id,
            Event::StaffAdded(s) | Event::StaffUpdated(s) => s.business_id,
            Event::ServiceDefined(s) | Event::ServiceUpdated(s) => s.business_id,
            Event::WindowSet(w) => w.business_id,
            Event::TimeOffAdded(t) => t.business_id,
            Event::BookingCreated(b) => b.business_id,
            Event::WindowDeactivated { business_id, .. }
            | Event::TimeOffRemoved { business_id, .. } => *business_id,
            Event::BookingRescheduled { from: lane, .. }
            | Event::BookingCancelled { lane, .. }
            | Event::PaymentConfirmed { lane, .. }
            | Event::PaymentRefunded { lane, .. }
            | Event::ReminderSent { lane, .. } => lane.day.business_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub time: ClockTime,
    pub available: bool,
}

/// Slot grid for one service/date/staff, ready for JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotListing {
    pub date: NaiveDate,
    pub staff_id: Option<Ulid>,
    /// No availability window resolved for the day.
    pub closed: bool,
    pub slots: Vec<Slot>,
}

/// A booking plus what the customer may still do with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedBooking {
    pub booking: Booking,
    pub can_cancel: bool,
    pub can_reschedule: bool,
}
