mod allocator;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod schedule;
mod slots;
mod store;

pub use allocator::{FirstEligible, NewBooking, StaffAssigner};
pub use availability::{merge_overlapping, normalize, open_intervals, subtract_intervals};
pub use error::EngineError;
pub use mutations::{BusinessChanges, NewBusiness, NewService, NewTimeOff, TimeOffRange};
pub use schedule::{ScheduleSource, pick_window, select_time_offs};
pub use slots::{SlotIter, blocked_spans, generate_slots};
pub use store::{Catalog, CatalogCounts};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{
    Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot,
};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedLane = Arc<RwLock<LaneState>>;

/// Default step between candidate slot starts.
pub const DEFAULT_SLOT_GRANULARITY: Minute = 30;

/// How often a booking-id write re-resolves its lane after losing a race
/// with a reschedule.
const LOCATE_ATTEMPTS: usize = 4;

// ── Group-commit WAL channel ─────────────────────────────

type AppendReply = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: AppendReply },
    Control(Control),
}

pub(super) enum Control {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
///
/// Blocks for the first append, drains whatever else is already queued,
/// then writes the batch with a single fsync. A control command found while
/// draining runs after the batch it interrupted.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(control) => {
                run_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Control(control) => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            run_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, AppendReply)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = write_batch(wal, batch.iter().map(|(event, _)| event));
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL group commit failed");
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn write_batch<'a>(wal: &mut Wal, events: impl Iterator<Item = &'a Event>) -> io::Result<()> {
    let mut appended = Ok(());
    for event in events {
        appended = wal.append_buffered(event);
        if appended.is_err() {
            break;
        }
    }
    // Flush even after a failed append so stale bytes never join the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn run_control(wal: &mut Wal, control: Control) {
    match control {
        Control::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        Control::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Lock regions ─────────────────────────────────────────

/// How a write uses the lanes it locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Access {
    /// Occupies time: needs every lane it can conflict with.
    Claim,
    /// Edits an existing booking in place.
    Touch,
}

/// Write access to a set of lanes, plus the gates that make it consistent.
///
/// Acquisition order is fixed: commit gate, day gates by `DayKey`, lanes by
/// `LaneKey`.
pub(super) struct LaneLocks {
    _commit: Option<OwnedRwLockReadGuard<()>>,
    _shared_days: Vec<OwnedRwLockReadGuard<()>>,
    _exclusive_days: Vec<OwnedRwLockWriteGuard<()>>,
    /// Sorted by key.
    lanes: Vec<(LaneKey, OwnedRwLockWriteGuard<LaneState>)>,
}

impl LaneLocks {
    fn position(&self, key: LaneKey) -> Option<usize> {
        self.lanes.binary_search_by_key(&key, |(k, _)| *k).ok()
    }

    pub(super) fn lane(&self, key: LaneKey) -> Option<&LaneState> {
        self.position(key).map(|i| &*self.lanes[i].1)
    }

    pub(super) fn lane_mut(&mut self, key: LaneKey) -> Option<&mut LaneState> {
        self.position(key).map(|i| &mut *self.lanes[i].1)
    }

    pub(super) fn booking(&self, key: LaneKey, id: Ulid) -> Option<&Booking> {
        self.lane(key)?.get(id)
    }

    pub(super) fn booking_mut(&mut self, key: LaneKey, id: Ulid) -> Option<&mut Booking> {
        self.lane_mut(key)?.get_mut(id)
    }

    /// Locked lanes of one business day.
    pub(super) fn lanes_of_day(&self, day: DayKey) -> impl Iterator<Item = &LaneState> {
        self.lanes
            .iter()
            .filter(move |(k, _)| k.day == day)
            .map(|(_, g)| &**g)
    }
}

/// Serializes catalog writes of one business.
pub(super) struct CatalogGuard {
    _commit: OwnedRwLockReadGuard<()>,
    _business: OwnedMutexGuard<()>,
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) catalog: Catalog,
    pub(super) lanes: DashMap<LaneKey, SharedLane>,
    pub(super) day_gates: DashMap<DayKey, Arc<RwLock<()>>>,
    /// Lanes that exist for each business day.
    pub(super) day_lanes: DashMap<DayKey, Vec<Lane>>,
    /// Reverse lookup: booking id → lane holding it.
    pub(super) booking_lanes: DashMap<Ulid, LaneKey>,
    /// Payment reference → booking id.
    pub(super) payment_refs: DashMap<Ulid, Ulid>,
    pub(super) catalog_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Shared by every write, exclusive while compaction snapshots state.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) assigner: Arc<dyn StaffAssigner>,
    pub(super) granularity: Minute,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<dyn Notifier>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            catalog: Catalog::new(),
            lanes: DashMap::new(),
            day_gates: DashMap::new(),
            day_lanes: DashMap::new(),
            booking_lanes: DashMap::new(),
            payment_refs: DashMap::new(),
            catalog_locks: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify,
            clock: Arc::new(SystemClock),
            assigner: Arc::new(FirstEligible),
            granularity: DEFAULT_SLOT_GRANULARITY,
        };

        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                businesses = engine.catalog.business_count(),
                bookings = engine.booking_lanes.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_assigner(mut self, assigner: Arc<dyn StaffAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_slot_granularity(mut self, minutes: Minute) -> Result<Self, EngineError> {
        slots::validate_granularity(minutes)?;
        self.granularity = minutes;
        Ok(self)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn slot_granularity(&self) -> Minute {
        self.granularity
    }

    /// Current time on the engine's clock.
    pub fn now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }

    /// Replay runs before the engine is shared, so every lock is uncontended.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let keys = booking_event_lanes(event);
        if keys.is_empty() {
            self.catalog.apply(event);
            return Ok(());
        }
        let mut lanes = Vec::with_capacity(keys.len());
        for key in sorted_unique(keys) {
            let guard = self
                .lane(key)
                .try_write_owned()
                .map_err(|_| io::Error::other("replay: lane already locked"))?;
            lanes.push((key, guard));
        }
        let mut locks = LaneLocks {
            _commit: None,
            _shared_days: Vec::new(),
            _exclusive_days: Vec::new(),
            lanes,
        };
        self.apply_booking_event(&mut locks, event);
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn wal_control<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(make(tx)))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// WAL-append, apply to the locked lanes, then notify.
    pub(super) async fn commit(&self, locks: &mut LaneLocks, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_booking_event(locks, &event);
        self.notify.event_committed(&event);
        Ok(())
    }

    /// Caller holds the business's `CatalogGuard`.
    pub(super) async fn commit_catalog(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.catalog.apply(&event);
        self.notify.event_committed(&event);
        Ok(())
    }

    pub(super) async fn lock_catalog(&self, business_id: Ulid) -> CatalogGuard {
        let commit = self.commit_gate.clone().read_owned().await;
        let mutex = self
            .catalog_locks
            .entry(business_id)
            .or_default()
            .value()
            .clone();
        CatalogGuard {
            _commit: commit,
            _business: mutex.lock_owned().await,
        }
    }

    fn day_gate(&self, day: DayKey) -> Arc<RwLock<()>> {
        self.day_gates.entry(day).or_default().value().clone()
    }

    /// Get or create a lane, registering it with its day.
    fn lane(&self, key: LaneKey) -> SharedLane {
        if let Some(lane) = self.lanes.get(&key) {
            return lane.value().clone();
        }
        self.lanes
            .entry(key)
            .or_insert_with(|| {
                self.day_lanes.entry(key.day).or_default().push(key.lane);
                Arc::new(RwLock::new(LaneState::new(key)))
            })
            .value()
            .clone()
    }

    pub(super) fn existing_lane(&self, key: LaneKey) -> Option<SharedLane> {
        self.lanes.get(&key).map(|e| e.value().clone())
    }

    pub(super) fn lanes_of_day(&self, day: DayKey) -> Vec<Lane> {
        self.day_lanes
            .get(&day)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Lock `keys` for writing.
    ///
    /// A `Claim` on an unassigned lane takes its day exclusively and locks
    /// every lane of that day, since unassigned bookings conflict with all of
    /// them. Any other write shares the day gate and locks only its own lanes.
    pub(super) async fn lock_lanes(&self, keys: &[LaneKey], access: Access) -> LaneLocks {
        let commit = self.commit_gate.clone().read_owned().await;

        let mut days: Vec<DayKey> = keys.iter().map(|k| k.day).collect();
        days.sort();
        days.dedup();

        let mut wanted = keys.to_vec();
        let mut shared_days = Vec::new();
        let mut exclusive_days = Vec::new();
        for day in days {
            let gate = self.day_gate(day);
            let whole_day = access == Access::Claim
                && keys.iter().any(|k| k.day == day && k.lane == Lane::Unassigned);
            if whole_day {
                exclusive_days.push(gate.write_owned().await);
                wanted.extend(self.lanes_of_day(day).into_iter().map(|lane| LaneKey { day, lane }));
            } else {
                shared_days.push(gate.read_owned().await);
            }
        }

        let mut lanes = Vec::new();
        for key in sorted_unique(wanted) {
            lanes.push((key, self.lane(key).write_owned().await));
        }

        LaneLocks {
            _commit: Some(commit),
            _shared_days: shared_days,
            _exclusive_days: exclusive_days,
            lanes,
        }
    }

    /// Lock the lane holding booking `id`, and its lane on `move_to` if given.
    /// Re-resolves if a concurrent reschedule moved the booking meanwhile.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
        access: Access,
        move_to: Option<NaiveDate>,
    ) -> Result<(LaneKey, LaneLocks), EngineError> {
        for _ in 0..LOCATE_ATTEMPTS {
            let from = self
                .booking_lanes
                .get(&id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(id))?;
            let mut keys = vec![from];
            if let Some(date) = move_to {
                keys.push(from.on_date(date));
            }
            let locks = self.lock_lanes(&keys, access).await;
            if locks.booking(from, id).is_some() {
                return Ok((from, locks));
            }
        }
        Err(EngineError::NotFound(id))
    }

    /// Apply a booking event to lanes the caller has locked.
    fn apply_booking_event(&self, locks: &mut LaneLocks, event: &Event) {
        match event {
            Event::BookingCreated(booking) => {
                let key = booking.lane_key();
                if let Some(lane) = locks.lane_mut(key) {
                    lane.insert_booking(booking.clone());
                }
                self.booking_lanes.insert(booking.id, key);
                self.payment_refs.insert(booking.payment_reference, booking.id);
            }
            Event::BookingRescheduled {
                id,
                from,
                date,
                start_time,
                end_time,
            } => {
                let Some(mut booking) = locks.lane_mut(*from).and_then(|l| l.remove_booking(*id))
                else {
                    return;
                };
                booking.date = *date;
                booking.start_time = *start_time;
                booking.end_time = *end_time;
                let to = from.on_date(*date);
                if let Some(lane) = locks.lane_mut(to) {
                    lane.insert_booking(booking);
                }
                self.booking_lanes.insert(*id, to);
            }
            Event::BookingCancelled { id, lane, at, reason } => {
                if let Some(b) = locks.booking_mut(*lane, *id) {
                    b.status = BookingStatus::Cancelled;
                    b.cancelled_at = Some(*at);
                    b.cancellation_reason = Some(reason.clone());
                }
            }
            Event::PaymentConfirmed { id, lane } => {
                if let Some(b) = locks.booking_mut(*lane, *id) {
                    b.payment_status = PaymentStatus::Paid;
                    if b.status == BookingStatus::PendingPayment {
                        b.status = BookingStatus::Confirmed;
                    }
                }
            }
            Event::PaymentRefunded { id, lane, at } => {
                if let Some(b) = locks.booking_mut(*lane, *id) {
                    b.payment_status = PaymentStatus::Refunded;
                    if b.status != BookingStatus::Cancelled {
                        b.status = BookingStatus::Cancelled;
                        b.cancelled_at = Some(*at);
                        b.cancellation_reason = Some(REFUND_REASON.into());
                    }
                }
            }
            Event::ReminderSent { id, lane, kind, at } => {
                if let Some(b) = locks.booking_mut(*lane, *id) {
                    match kind {
                        ReminderKind::DayBefore => b.reminder_24h_sent_at = Some(*at),
                        ReminderKind::HourBefore => b.reminder_1h_sent_at = Some(*at),
                    }
                }
            }
            _ => {}
        }
    }

    /// Events appended since the last compaction.
    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal_control(|response| Control::AppendsSinceCompact { response })
            .await
    }

    /// Rewrite the WAL as the minimal event set reproducing current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No write can be between WAL append and apply while this is held.
        let _exclusive = self.commit_gate.write().await;

        let mut events = self.catalog.snapshot_events();
        let lanes: Vec<SharedLane> = self.lanes.iter().map(|e| e.value().clone()).collect();
        let mut bookings = Vec::new();
        for lane in lanes {
            bookings.extend(lane.read().await.bookings.iter().cloned());
        }
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(Event::BookingCreated));

        let count = events.len();
        self.wal_control(|response| Control::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = count, "compacted WAL");
        Ok(())
    }
}

pub(super) const REFUND_REASON: &str = "Payment refunded";

/// Lanes a booking event touches. Empty for catalog events.
fn booking_event_lanes(event: &Event) -> Vec<LaneKey> {
    match event {
        Event::BookingCreated(b) => vec![b.lane_key()],
        Event::BookingRescheduled { from, date, .. } => vec![*from, from.on_date(*date)],
        Event::BookingCancelled { lane, .. }
        | Event::PaymentConfirmed { lane, .. }
        | Event::PaymentRefunded { lane, .. }
        | Event::ReminderSent { lane, .. } => vec![*lane],
        _ => Vec::new(),
    }
}

fn sorted_unique(mut keys: Vec<LaneKey>) -> Vec<LaneKey> {
    keys.sort();
    keys.dedup();
    keys
}
