use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::allocator::may_change;
use super::availability::open_intervals;
use super::schedule::ScheduleSource;
use super::slots::{blocked_spans, generate_slots, validate_date};
use super::{Engine, EngineError, SharedLane};

impl Engine {
    pub fn resolve_window(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        day_of_week: u8,
    ) -> Option<AvailabilityWindow> {
        self.catalog.resolve_window(business_id, staff_id, day_of_week)
    }

    /// Time-off blocks touching `date`, ordered by start.
    pub fn time_offs_on(&self, business_id: Ulid, staff_id: Option<Ulid>, date: NaiveDate) -> Vec<TimeOffBlock> {
        let day_start = at_minute(date, 0);
        let day_end = at_minute(date, MINUTES_PER_DAY);
        self.catalog
            .time_offs_overlapping(business_id, staff_id, day_start, day_end)
    }

    fn check_staff_scope(&self, business_id: Ulid, staff_id: Option<Ulid>) -> Result<(), EngineError> {
        if let Some(staff_id) = staff_id {
            self.catalog.active_staff_member(business_id, staff_id)?;
        }
        Ok(())
    }

    /// Slot grid for a service on a date. Advisory: never takes a write lock.
    pub async fn slots(
        &self,
        business_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        staff_id: Option<Ulid>,
    ) -> Result<SlotListing, EngineError> {
        let started = Instant::now();
        validate_date(date)?;
        self.catalog.active_business(business_id)?;
        let service = self.catalog.active_service(business_id, service_id)?;
        self.check_staff_scope(business_id, staff_id)?;

        let window = self.resolve_window(business_id, staff_id, day_of_week(date));
        let booked = self.booked_spans(business_id, staff_id, date).await;
        let time_offs = self.time_offs_on(business_id, staff_id, date);
        let duration = i32::try_from(service.duration_minutes).unwrap_or(i32::MAX);

        let iter = generate_slots(window.as_ref(), duration, &booked, &time_offs, date, self.granularity)?;
        let listing = SlotListing {
            date,
            staff_id,
            closed: iter.is_closed(),
            slots: iter.collect(),
        };
        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(listing)
    }

    /// Disjoint free spans of a day: window minus time off minus bookings.
    pub async fn open_intervals(
        &self,
        business_id: Ulid,
        date: NaiveDate,
        staff_id: Option<Ulid>,
    ) -> Result<Vec<Span>, EngineError> {
        validate_date(date)?;
        self.catalog.active_business(business_id)?;
        self.check_staff_scope(business_id, staff_id)?;

        let window = self.resolve_window(business_id, staff_id, day_of_week(date));
        let blocked = blocked_spans(&self.time_offs_on(business_id, staff_id, date), date);
        let booked = self.booked_spans(business_id, staff_id, date).await;
        Ok(open_intervals(window.map(|w| w.span()), &blocked, &booked))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let key = self
            .booking_lanes
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let lane = self.existing_lane(key).ok_or(EngineError::NotFound(id))?;
        let guard = lane.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Customer-facing lookup. When given, the email (case-insensitive) or the
    /// short payment reference must match; a mismatch reads as not found.
    pub async fn manage_booking(
        &self,
        business_id: Ulid,
        id: Ulid,
        email: Option<&str>,
        reference: Option<&str>,
    ) -> Result<ManagedBooking, EngineError> {
        let booking = self.get_booking(id).await?;
        if booking.business_id != business_id {
            return Err(EngineError::NotFound(id));
        }
        let email_ok = email.is_none_or(|e| e.trim().eq_ignore_ascii_case(&booking.customer.email));
        let reference_ok = reference.is_none_or(|r| r.trim().to_uppercase() == booking.short_reference());
        if !email_ok || !reference_ok {
            return Err(EngineError::NotFound(id));
        }

        let allowed = may_change(
            &booking,
            self.catalog.cancellation_hours(business_id),
            self.clock.now(),
        );
        Ok(ManagedBooking {
            booking,
            can_cancel: allowed,
            can_reschedule: allowed,
        })
    }

    /// All bookings of a business on a date, cancelled ones included.
    pub async fn bookings_on(&self, business_id: Ulid, date: NaiveDate) -> Vec<Booking> {
        let day = DayKey { business_id, date };
        let mut bookings = Vec::new();
        for lane in self.lanes_of_day(day) {
            let Some(lane) = self.existing_lane(LaneKey { day, lane }) else { continue };
            bookings.extend(lane.read().await.bookings.iter().cloned());
        }
        bookings.sort_by_key(|b| (b.start_time, b.id));
        bookings
    }

    /// Every booking matching `pred` on or after `from`, visiting one lane at a time.
    async fn scan_bookings(&self, from: Option<NaiveDate>, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let lanes: Vec<SharedLane> = self
            .lanes
            .iter()
            .filter(|e| from.is_none_or(|from| e.key().day.date >= from))
            .map(|e| e.value().clone())
            .collect();
        let mut hits = Vec::new();
        for lane in lanes {
            let guard = lane.read().await;
            hits.extend(guard.bookings.iter().filter(|b| pred(b)).cloned());
        }
        hits.sort_by_key(|b| b.id);
        hits
    }

    /// Confirmed, paid bookings whose start falls in the reminder's window
    /// and which have not had this reminder yet.
    pub async fn bookings_needing_reminder(&self, kind: ReminderKind) -> Vec<Booking> {
        let now = self.clock.now();
        let (min_hours, max_hours) = kind.window_hours();
        // Reminders only go out ahead of a start, so past days are skipped.
        self.scan_bookings(Some(now.date()), |b| {
            let until = (b.starts_at() - now).num_minutes();
            b.status == BookingStatus::Confirmed
                && b.payment_status == PaymentStatus::Paid
                && b.reminder_sent_at(kind).is_none()
                && until > min_hours * 60
                && until <= max_hours * 60
        })
        .await
    }

    /// Unpaid bookings created at or before `cutoff`.
    pub async fn stale_pending_bookings(&self, cutoff: NaiveDateTime) -> Vec<Ulid> {
        self.scan_bookings(None, |b| {
            b.status == BookingStatus::PendingPayment
                && b.payment_status == PaymentStatus::Pending
                && b.created_at <= cutoff
        })
        .await
        .into_iter()
        .map(|b| b.id)
        .collect()
    }
}
