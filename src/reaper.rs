use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError};
use crate::model::ReminderKind;

/// What one reaper pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub expired: usize,
    pub reminders: usize,
}

/// One pass: expire unpaid bookings older than `pending_ttl`, then send due reminders.
pub async fn sweep(engine: &Engine, pending_ttl: Option<TimeDelta>) -> Result<Sweep, EngineError> {
    let mut done = Sweep::default();
    if let Some(ttl) = pending_ttl {
        let cutoff = engine.now() - ttl;
        for id in engine.stale_pending_bookings(cutoff).await {
            match engine.expire_pending(id).await {
                Ok(true) => done.expired += 1,
                Ok(false) => {}
                // Paid or cancelled in the meantime
                Err(e) => debug!("reaper skip {id}: {e}"),
            }
        }
    }
    for kind in [ReminderKind::DayBefore, ReminderKind::HourBefore] {
        done.reminders += engine.dispatch_reminders(kind).await?;
    }
    Ok(done)
}

/// Background task that expires stale holds and sends reminders.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration, pending_ttl: Option<TimeDelta>) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match sweep(&engine, pending_ttl).await {
            Ok(done) if done.expired > 0 => info!(expired = done.expired, "expired unpaid bookings"),
            Ok(_) => {}
            Err(e) => error!("reaper pass failed: {e}"),
        }
    }
}

/// Compact when enough appends have piled up. Returns whether it did.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    if engine.wal_appends_since_compact().await? < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{NewBooking, NewBusiness, NewService};
    use crate::model::*;
    use crate::notify::{Notification, NotifyHub};
    use chrono::{NaiveDate, NaiveDateTime};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotline_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    async fn setup(name: &str) -> (Arc<Engine>, Arc<ManualClock>, Arc<NotifyHub>, NewBooking) {
        let notify = Arc::new(NotifyHub::new());
        let clock = Arc::new(ManualClock::new(at("2024-06-01 08:00")));
        let engine = Engine::new(test_wal_path(name), notify.clone())
            .unwrap()
            .with_clock(clock.clone());
        let business = engine
            .register_business(NewBusiness {
                slug: "reaper".into(),
                name: "Reaper".into(),
                cancellation_hours: None,
            })
            .await
            .unwrap();
        let staff = engine.add_staff(business.id, "Sam").await.unwrap();
        let service = engine
            .define_service(
                business.id,
                NewService {
                    name: "Trim".into(),
                    duration_minutes: 30,
                    price: 1_000,
                    sort_order: 0,
                    staff: vec![staff.id],
                },
            )
            .await
            .unwrap();
        let req = NewBooking {
            business_id: business.id,
            service_id: service.id,
            staff_id: None,
            date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            start_time: "10:00".parse().unwrap(),
            customer: Customer {
                name: "Ada".into(),
                email: "ada@example.com".into(),
                phone: None,
            },
        };
        (Arc::new(engine), clock, notify, req)
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_pending() {
        let (engine, clock, _notify, req) = setup("reaper_expire.wal").await;
        let stale = engine.create_booking(req.clone()).await.unwrap();
        clock.advance(TimeDelta::minutes(20));
        let mut fresh_req = req;
        fresh_req.start_time = "11:00".parse().unwrap();
        let fresh = engine.create_booking(fresh_req).await.unwrap();
        clock.advance(TimeDelta::minutes(15));

        let done = sweep(&engine, Some(TimeDelta::minutes(30))).await.unwrap();
        assert_eq!(done, Sweep { expired: 1, reminders: 0 });
        assert_eq!(engine.get_booking(stale.id).await.unwrap().status, BookingStatus::Cancelled);
        assert_eq!(engine.get_booking(fresh.id).await.unwrap().status, BookingStatus::PendingPayment);
    }

    #[tokio::test]
    async fn sweep_without_ttl_keeps_pending() {
        let (engine, clock, _notify, req) = setup("reaper_no_ttl.wal").await;
        let b = engine.create_booking(req).await.unwrap();
        clock.advance(TimeDelta::days(1));
        assert_eq!(sweep(&engine, None).await.unwrap(), Sweep::default());
        assert_eq!(engine.get_booking(b.id).await.unwrap().status, BookingStatus::PendingPayment);
    }

    #[tokio::test]
    async fn sweep_sends_each_reminder_once() {
        let (engine, clock, notify, req) = setup("reaper_remind.wal").await;
        let b = engine.create_booking(req).await.unwrap();
        engine.on_payment_confirmed(b.id).await.unwrap();
        let mut rx = notify.subscribe();

        clock.set(at("2024-06-02 10:00"));
        assert_eq!(sweep(&engine, None).await.unwrap().reminders, 1);
        assert_eq!(sweep(&engine, None).await.unwrap().reminders, 0);
        clock.set(at("2024-06-03 09:30"));
        assert_eq!(sweep(&engine, None).await.unwrap().reminders, 1);

        let kinds: Vec<ReminderKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|n| match n {
                Notification::BookingReminder { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, [ReminderKind::DayBefore, ReminderKind::HourBefore]);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let (engine, _clock, _notify, _req) = setup("reaper_compact.wal").await;
        // register + staff + service
        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert!(compact_if_needed(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await.unwrap(), 0);
    }
}
