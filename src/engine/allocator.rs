use chrono::{NaiveDate, NaiveDateTime};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::*;

use super::conflict::{check_lane_capacity, find_conflict};
use super::mutations::{validate_customer, validate_text};
use super::slots::validate_date;
use super::{Access, Engine, EngineError, REFUND_REASON};
use crate::limits::MAX_REASON_LEN;

const DEFAULT_CANCEL_REASON: &str = "Cancelled by customer";
const EXPIRED_REASON: &str = "Payment not received";

/// Picks a staff member when the customer did not ask for one.
pub trait StaffAssigner: Send + Sync {
    /// `eligible` holds the service's active staff, ordered by id.
    fn assign(&self, service: &Service, eligible: &[StaffMember]) -> Option<Ulid>;
}

/// The first eligible staff member; unassigned if the service lists none.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstEligible;

impl StaffAssigner for FirstEligible {
    fn assign(&self, _service: &Service, eligible: &[StaffMember]) -> Option<Ulid> {
        eligible.first().map(|s| s.id)
    }
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub business_id: Ulid,
    pub service_id: Ulid,
    /// `None` lets the engine's `StaffAssigner` choose.
    pub staff_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub customer: Customer,
}

/// Whether a booking may still be cancelled or rescheduled at `now`.
pub(super) fn may_change(booking: &Booking, cancellation_hours: Option<u32>, now: NaiveDateTime) -> bool {
    if booking.status != BookingStatus::Confirmed || booking.is_past(now) {
        return false;
    }
    match cancellation_hours {
        None | Some(0) => true,
        Some(hours) => (booking.starts_at() - now).num_minutes() >= i64::from(hours) * 60,
    }
}

fn booking_end(start: ClockTime, duration: Minute) -> Result<ClockTime, EngineError> {
    start
        .checked_add(duration)
        .ok_or_else(|| EngineError::Validation("booking would run past midnight".into()))
}

impl Engine {
    fn resolve_staff(&self, service: &Service, requested: Option<Ulid>) -> Result<Option<Ulid>, EngineError> {
        let business_id = service.business_id;
        if let Some(staff_id) = requested {
            self.catalog.active_staff_member(business_id, staff_id)?;
            if !service.staff.is_empty() && !service.staff.contains(&staff_id) {
                return Err(EngineError::Validation(format!(
                    "staff {staff_id} does not perform this service"
                )));
            }
            return Ok(Some(staff_id));
        }
        let eligible: Vec<StaffMember> = self
            .catalog
            .staff_of(business_id)
            .into_iter()
            .filter(|s| s.is_active && service.staff.contains(&s.id))
            .collect();
        Ok(self.assigner.assign(service, &eligible))
    }

    /// Reserve a slot. The conflict check that decides the outcome runs under
    /// the lane locks, so concurrent attempts on one region yield one winner.
    #[tracing::instrument(skip(self, req), fields(business = %req.business_id, date = %req.date, time = %req.start_time))]
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        validate_date(req.date)?;
        self.catalog.active_business(req.business_id)?;
        let service = self.catalog.active_service(req.business_id, req.service_id)?;
        validate_customer(&req.customer)?;

        let duration = service.duration_minutes as Minute;
        let end_time = booking_end(req.start_time, duration)?;
        let now = self.clock.now();
        if at_minute(req.date, req.start_time.minutes()) <= now {
            return Err(EngineError::Validation("booking must start in the future".into()));
        }
        let staff_id = self.resolve_staff(&service, req.staff_id)?;

        let key = LaneKey {
            day: DayKey {
                business_id: req.business_id,
                date: req.date,
            },
            lane: Lane::from(staff_id),
        };
        let span = Span::between(req.start_time, end_time);

        let mut locks = self.lock_lanes(&[key], Access::Claim).await;
        if let Some(existing) = find_conflict(&locks, key, &span, None) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            info!(%existing, "slot already taken");
            return Err(EngineError::SlotUnavailable(existing));
        }
        check_lane_capacity(&locks, key)?;

        let booking = Booking {
            id: Ulid::new(),
            business_id: req.business_id,
            service_id: service.id,
            staff_id,
            date: req.date,
            start_time: req.start_time,
            end_time,
            status: BookingStatus::PendingPayment,
            payment_status: PaymentStatus::Pending,
            customer: req.customer,
            amount: service.price,
            payment_reference: Ulid::new(),
            created_at: now,
            cancelled_at: None,
            cancellation_reason: None,
            reminder_24h_sent_at: None,
            reminder_1h_sent_at: None,
        };
        self.commit(&mut locks, Event::BookingCreated(booking.clone()))
            .await?;

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(booking = %booking.id, staff = ?booking.staff_id, "booking created");
        Ok(booking)
    }

    /// Move a booking in place. Its current slot does not count as a conflict.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        date: NaiveDate,
        start_time: ClockTime,
    ) -> Result<Booking, EngineError> {
        validate_date(date)?;
        let (from, mut locks) = self.lock_booking(id, Access::Claim, Some(date)).await?;
        let booking = locks.booking(from, id).cloned().ok_or(EngineError::NotFound(id))?;

        let now = self.clock.now();
        if !may_change(&booking, self.catalog.cancellation_hours(booking.business_id), now) {
            return Err(EngineError::NotCancellable(id));
        }
        let duration = self
            .catalog
            .service(booking.business_id, booking.service_id)
            .map(|s| s.duration_minutes as Minute)
            .unwrap_or_else(|_| booking.span().duration());
        let end_time = booking_end(start_time, duration)?;
        if at_minute(date, start_time.minutes()) <= now {
            return Err(EngineError::Validation("booking must start in the future".into()));
        }

        let to = from.on_date(date);
        let span = Span::between(start_time, end_time);
        if let Some(existing) = find_conflict(&locks, to, &span, Some(id)) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotUnavailable(existing));
        }
        if to != from {
            check_lane_capacity(&locks, to)?;
        }

        let event = Event::BookingRescheduled {
            id,
            from,
            date,
            start_time,
            end_time,
        };
        self.commit(&mut locks, event).await?;
        metrics::counter!(BOOKINGS_RESCHEDULED_TOTAL).increment(1);
        info!(booking = %id, %date, time = %start_time, "booking rescheduled");

        locks.booking(to, id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Customer or owner cancellation, subject to the cancellation policy.
    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        validate_text("cancellation reason", &reason, MAX_REASON_LEN)?;

        let (lane, mut locks) = self.lock_booking(id, Access::Touch, None).await?;
        let booking = locks.booking(lane, id).cloned().ok_or(EngineError::NotFound(id))?;
        let now = self.clock.now();
        if !may_change(&booking, self.catalog.cancellation_hours(booking.business_id), now) {
            return Err(EngineError::NotCancellable(id));
        }

        self.commit(&mut locks, Event::BookingCancelled { id, lane, at: now, reason })
            .await?;
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL, "cause" => "customer").increment(1);
        info!(booking = %id, "booking cancelled");
        locks.booking(lane, id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Payment cleared. Idempotent: an already-paid booking is returned unchanged.
    pub async fn on_payment_confirmed(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (lane, mut locks) = self.lock_booking(id, Access::Touch, None).await?;
        let booking = locks.booking(lane, id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.payment_status != PaymentStatus::Pending {
            return Ok(booking);
        }

        self.commit(&mut locks, Event::PaymentConfirmed { id, lane }).await?;
        let booking = locks.booking(lane, id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(locks);

        metrics::counter!(PAYMENTS_CONFIRMED_TOTAL).increment(1);
        if booking.status == BookingStatus::Confirmed {
            info!(booking = %id, "payment confirmed");
            self.notify.booking_confirmed(&booking);
        } else {
            warn!(booking = %id, status = ?booking.status, "payment received for inactive booking");
        }
        Ok(booking)
    }

    pub async fn on_payment_confirmed_by_reference(&self, reference: Ulid) -> Result<Booking, EngineError> {
        let id = self.booking_for_reference(reference)?;
        self.on_payment_confirmed(id).await
    }

    /// Provider refunded the payment: the booking is cancelled and frees its slot.
    pub async fn on_payment_refunded(&self, reference: Ulid) -> Result<Booking, EngineError> {
        let id = self.booking_for_reference(reference)?;
        let (lane, mut locks) = self.lock_booking(id, Access::Touch, None).await?;
        let booking = locks.booking(lane, id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.payment_status == PaymentStatus::Refunded {
            return Ok(booking);
        }

        let now = self.clock.now();
        self.commit(&mut locks, Event::PaymentRefunded { id, lane, at: now }).await?;
        if booking.is_active() {
            metrics::counter!(BOOKINGS_CANCELLED_TOTAL, "cause" => "refund").increment(1);
        }
        info!(booking = %id, reason = REFUND_REASON, "payment refunded");
        locks.booking(lane, id).cloned().ok_or(EngineError::NotFound(id))
    }

    fn booking_for_reference(&self, reference: Ulid) -> Result<Ulid, EngineError> {
        self.payment_refs
            .get(&reference)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(reference))
    }

    /// Cancel a booking still awaiting payment. Returns false if it moved on.
    pub async fn expire_pending(&self, id: Ulid) -> Result<bool, EngineError> {
        let (lane, mut locks) = self.lock_booking(id, Access::Touch, None).await?;
        let still_pending = locks.booking(lane, id).is_some_and(|b| {
            b.status == BookingStatus::PendingPayment && b.payment_status == PaymentStatus::Pending
        });
        if !still_pending {
            return Ok(false);
        }
        let event = Event::BookingCancelled {
            id,
            lane,
            at: self.clock.now(),
            reason: EXPIRED_REASON.into(),
        };
        self.commit(&mut locks, event).await?;
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL, "cause" => "expired").increment(1);
        info!(booking = %id, "unpaid booking expired");
        Ok(true)
    }

    /// Record a reminder as sent. Returns the booking only the first time.
    pub async fn mark_reminder_sent(&self, id: Ulid, kind: ReminderKind) -> Result<Option<Booking>, EngineError> {
        let (lane, mut locks) = self.lock_booking(id, Access::Touch, None).await?;
        let already = locks
            .booking(lane, id)
            .is_none_or(|b| b.reminder_sent_at(kind).is_some());
        if already {
            return Ok(None);
        }
        let event = Event::ReminderSent {
            id,
            lane,
            kind,
            at: self.clock.now(),
        };
        self.commit(&mut locks, event).await?;
        metrics::counter!(REMINDERS_SENT_TOTAL, "kind" => kind.label()).increment(1);
        Ok(locks.booking(lane, id).cloned())
    }

    /// Send every reminder of `kind` that is due now. Each goes out at most once.
    pub async fn dispatch_reminders(&self, kind: ReminderKind) -> Result<usize, EngineError> {
        let mut sent = 0;
        for booking in self.bookings_needing_reminder(kind).await {
            if let Some(booking) = self.mark_reminder_sent(booking.id, kind).await? {
                self.notify.booking_reminder(&booking, kind);
                sent += 1;
            }
        }
        if sent > 0 {
            info!(kind = kind.label(), sent, "reminders dispatched");
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn confirmed_at_ten() -> Booking {
        Booking {
            id: Ulid::new(),
            business_id: Ulid::new(),
            service_id: Ulid::new(),
            staff_id: None,
            date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            start_time: "10:00".parse().unwrap(),
            end_time: "11:00".parse().unwrap(),
            status: BookingStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
            customer: Customer {
                name: "Ada".into(),
                email: "ada@example.com".into(),
                phone: None,
            },
            amount: 2_500,
            payment_reference: Ulid::new(),
            created_at: at("2024-06-01 08:00"),
            cancelled_at: None,
            cancellation_reason: None,
            reminder_24h_sent_at: None,
            reminder_1h_sent_at: None,
        }
    }

    #[test]
    fn cutoff_is_inclusive_at_exact_boundary() {
        let b = confirmed_at_ten();
        assert!(may_change(&b, Some(24), at("2024-06-09 10:00")));
        assert!(!may_change(&b, Some(24), at("2024-06-09 10:01")));
    }

    #[test]
    fn no_cutoff_allows_until_start() {
        let b = confirmed_at_ten();
        assert!(may_change(&b, None, at("2024-06-10 09:59")));
        assert!(may_change(&b, Some(0), at("2024-06-10 09:59")));
        assert!(!may_change(&b, None, at("2024-06-10 10:00")));
    }

    #[test]
    fn only_confirmed_bookings_may_change() {
        let mut b = confirmed_at_ten();
        b.status = BookingStatus::PendingPayment;
        assert!(!may_change(&b, None, at("2024-06-01 10:00")));
        b.status = BookingStatus::Cancelled;
        assert!(!may_change(&b, None, at("2024-06-01 10:00")));
    }

    #[test]
    fn first_eligible_takes_lowest_id() {
        let service = Service {
            id: Ulid::new(),
            business_id: Ulid::new(),
            name: "Cut".into(),
            duration_minutes: 30,
            price: 0,
            sort_order: 0,
            is_active: true,
            staff: vec![],
        };
        let staff = |id: Ulid| StaffMember {
            id,
            business_id: service.business_id,
            name: "S".into(),
            is_active: true,
        };
        let first = Ulid::new();
        let second = Ulid::new();
        assert_eq!(FirstEligible.assign(&service, &[staff(first), staff(second)]), Some(first));
        assert_eq!(FirstEligible.assign(&service, &[]), None);
    }

    #[test]
    fn end_past_midnight_is_rejected() {
        assert!(booking_end("23:30".parse().unwrap(), 60).is_err());
        assert_eq!(booking_end("23:00".parse().unwrap(), 60).unwrap(), ClockTime::END_OF_DAY);
    }
}
