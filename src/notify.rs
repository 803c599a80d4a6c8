use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Event, ReminderKind};

const CHANNEL_CAPACITY: usize = 256;

/// Something worth telling the outside world about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BookingConfirmed(Booking),
    BookingReminder { booking: Booking, kind: ReminderKind },
    /// Raw committed event, for change feeds.
    Committed(Event),
}

impl Notification {
    pub fn business_id(&self) -> Ulid {
        match self {
            Notification::BookingConfirmed(b) | Notification::BookingReminder { booking: b, .. } => {
                b.business_id
            }
            Notification::Committed(e) => e.business_id(),
        }
    }
}

/// Outbound side effects of the booking core. Implementations must not block.
pub trait Notifier: Send + Sync {
    /// Payment cleared and the booking is now confirmed.
    fn booking_confirmed(&self, booking: &Booking);

    /// A reminder has been recorded as sent and should go out.
    fn booking_reminder(&self, booking: &Booking, kind: ReminderKind);

    /// Every durable event, after it has been applied.
    fn event_committed(&self, _event: &Event) {}
}

/// Broadcast hub: one firehose for dispatchers plus a feed per business.
pub struct NotifyHub {
    all: broadcast::Sender<Notification>,
    businesses: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            businesses: DashMap::new(),
        }
    }

    /// Confirmation and reminder notifications for every business.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Everything about one business, committed events included.
    pub fn subscribe_business(&self, business_id: Ulid) -> broadcast::Receiver<Notification> {
        self.businesses
            .entry(business_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    fn send_business(&self, notification: &Notification) {
        let business_id = notification.business_id();
        let Some(sender) = self.businesses.get(&business_id) else {
            return;
        };
        if sender.send(notification.clone()).is_err() {
            drop(sender);
            self.businesses
                .remove_if(&business_id, |_, s| s.receiver_count() == 0);
        }
    }

    fn publish(&self, notification: Notification) {
        self.send_business(&notification);
        let _ = self.all.send(notification);
    }
}

impl Notifier for NotifyHub {
    fn booking_confirmed(&self, booking: &Booking) {
        self.publish(Notification::BookingConfirmed(booking.clone()));
    }

    fn booking_reminder(&self, booking: &Booking, kind: ReminderKind) {
        self.publish(Notification::BookingReminder {
            booking: booking.clone(),
            kind,
        });
    }

    fn event_committed(&self, event: &Event) {
        self.send_business(&Notification::Committed(event.clone()));
    }
}
