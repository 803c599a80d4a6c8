use chrono::NaiveDateTime;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::schedule::{ScheduleSource, pick_window, select_time_offs};

/// In-memory catalog: businesses and everything configured under them.
///
/// Every lookup is scoped by business; an entity belonging to another
/// business is reported as not found.
#[derive(Default)]
pub struct Catalog {
    businesses: DashMap<Ulid, Business>,
    slugs: DashMap<String, Ulid>,
    staff: DashMap<Ulid, StaffMember>,
    services: DashMap<Ulid, Service>,
    windows: DashMap<Ulid, AvailabilityWindow>,
    time_offs: DashMap<Ulid, TimeOffBlock>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Businesses ───────────────────────────────────────────

    pub fn business_count(&self) -> usize {
        self.businesses.len()
    }

    pub fn business(&self, id: Ulid) -> Result<Business, EngineError> {
        self.businesses
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn active_business(&self, id: Ulid) -> Result<Business, EngineError> {
        self.business(id)
            .and_then(|b| if b.is_active { Ok(b) } else { Err(EngineError::NotFound(id)) })
    }

    pub fn business_by_slug(&self, slug: &str) -> Option<Business> {
        let id = *self.slugs.get(slug)?.value();
        self.businesses.get(&id).map(|e| e.value().clone())
    }

    pub fn cancellation_hours(&self, business_id: Ulid) -> Option<u32> {
        self.businesses
            .get(&business_id)
            .and_then(|b| b.cancellation_hours)
    }

    // ── Staff ────────────────────────────────────────────────

    pub fn staff_member(&self, business_id: Ulid, id: Ulid) -> Result<StaffMember, EngineError> {
        self.staff
            .get(&id)
            .filter(|s| s.business_id == business_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn active_staff_member(&self, business_id: Ulid, id: Ulid) -> Result<StaffMember, EngineError> {
        self.staff_member(business_id, id)
            .and_then(|s| if s.is_active { Ok(s) } else { Err(EngineError::NotFound(id)) })
    }

    /// Staff of a business ordered by id (creation order).
    pub fn staff_of(&self, business_id: Ulid) -> Vec<StaffMember> {
        let mut staff: Vec<StaffMember> = self
            .staff
            .iter()
            .filter(|e| e.business_id == business_id)
            .map(|e| e.value().clone())
            .collect();
        staff.sort_by_key(|s| s.id);
        staff
    }

    // ── Services ─────────────────────────────────────────────

    pub fn service(&self, business_id: Ulid, id: Ulid) -> Result<Service, EngineError> {
        self.services
            .get(&id)
            .filter(|s| s.business_id == business_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn active_service(&self, business_id: Ulid, id: Ulid) -> Result<Service, EngineError> {
        self.service(business_id, id)
            .and_then(|s| if s.is_active { Ok(s) } else { Err(EngineError::NotFound(id)) })
    }

    /// Services of a business in display order.
    pub fn services_of(&self, business_id: Ulid) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|e| e.business_id == business_id)
            .map(|e| e.value().clone())
            .collect();
        services.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));
        services
    }

    // ── Windows ──────────────────────────────────────────────

    pub fn windows_of(&self, business_id: Ulid) -> Vec<AvailabilityWindow> {
        let mut windows: Vec<AvailabilityWindow> = self
            .windows
            .iter()
            .filter(|e| e.business_id == business_id)
            .map(|e| e.value().clone())
            .collect();
        windows.sort_by_key(|w| (w.day_of_week, w.staff_id, w.id));
        windows
    }

    pub fn window(&self, business_id: Ulid, id: Ulid) -> Result<AvailabilityWindow, EngineError> {
        self.windows
            .get(&id)
            .filter(|w| w.business_id == business_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// The stored window for a (staff, weekday) key, active or not.
    pub fn window_for_key(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        day_of_week: u8,
    ) -> Option<AvailabilityWindow> {
        self.windows
            .iter()
            .find(|w| {
                w.business_id == business_id
                    && w.staff_id == staff_id
                    && w.day_of_week == day_of_week
            })
            .map(|e| e.value().clone())
    }

    // ── Time off ─────────────────────────────────────────────

    pub fn time_off(&self, business_id: Ulid, id: Ulid) -> Result<TimeOffBlock, EngineError> {
        self.time_offs
            .get(&id)
            .filter(|t| t.business_id == business_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn time_offs_of(&self, business_id: Ulid) -> Vec<TimeOffBlock> {
        let mut blocks: Vec<TimeOffBlock> = self
            .time_offs
            .iter()
            .filter(|e| e.business_id == business_id)
            .map(|e| e.value().clone())
            .collect();
        blocks.sort_by_key(|b| (b.start, b.id));
        blocks
    }

    pub fn count_for(&self, business_id: Ulid) -> CatalogCounts {
        CatalogCounts {
            staff: self.staff.iter().filter(|e| e.business_id == business_id).count(),
            services: self.services.iter().filter(|e| e.business_id == business_id).count(),
            time_offs: self.time_offs.iter().filter(|e| e.business_id == business_id).count(),
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a catalog event. Booking events are ignored here.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::BusinessRegistered(b) | Event::BusinessUpdated(b) => {
                self.slugs.insert(b.slug.clone(), b.id);
                self.businesses.insert(b.id, b.clone());
            }
            Event::StaffAdded(s) | Event::StaffUpdated(s) => {
                self.staff.insert(s.id, s.clone());
            }
            Event::ServiceDefined(s) | Event::ServiceUpdated(s) => {
                self.services.insert(s.id, s.clone());
            }
            Event::WindowSet(w) => {
                self.windows.insert(w.id, w.clone());
            }
            Event::WindowDeactivated { id, .. } => {
                if let Some(mut w) = self.windows.get_mut(id) {
                    w.is_active = false;
                }
            }
            Event::TimeOffAdded(t) => {
                self.time_offs.insert(t.id, t.clone());
            }
            Event::TimeOffRemoved { id, .. } => {
                self.time_offs.remove(id);
            }
            Event::BookingCreated(_)
            | Event::BookingRescheduled { .. }
            | Event::BookingCancelled { .. }
            | Event::PaymentConfirmed { .. }
            | Event::PaymentRefunded { .. }
            | Event::ReminderSent { .. } => {}
        }
    }

    /// Minimal event sequence that rebuilds the catalog from scratch.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut businesses: Vec<Business> = self.businesses.iter().map(|e| e.value().clone()).collect();
        businesses.sort_by_key(|b| b.id);

        let mut events: Vec<Event> = businesses.into_iter().map(Event::BusinessRegistered).collect();
        let mut staff: Vec<StaffMember> = self.staff.iter().map(|e| e.value().clone()).collect();
        staff.sort_by_key(|s| s.id);
        events.extend(staff.into_iter().map(Event::StaffAdded));

        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(Event::ServiceDefined));

        let mut windows: Vec<AvailabilityWindow> = self.windows.iter().map(|e| e.value().clone()).collect();
        windows.sort_by_key(|w| w.id);
        events.extend(windows.into_iter().map(Event::WindowSet));

        let mut blocks: Vec<TimeOffBlock> = self.time_offs.iter().map(|e| e.value().clone()).collect();
        blocks.sort_by_key(|b| b.id);
        events.extend(blocks.into_iter().map(Event::TimeOffAdded));

        events
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogCounts {
    pub staff: usize,
    pub services: usize,
    pub time_offs: usize,
}

impl ScheduleSource for Catalog {
    fn resolve_window(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        day_of_week: u8,
    ) -> Option<AvailabilityWindow> {
        let windows = self.windows_of(business_id);
        pick_window(&windows, staff_id, day_of_week).cloned()
    }

    fn time_offs_overlapping(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Vec<TimeOffBlock> {
        let blocks = self.time_offs_of(business_id);
        select_time_offs(&blocks, staff_id, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn business() -> Business {
        Business {
            id: Ulid::new(),
            slug: "studio".into(),
            name: "Studio".into(),
            cancellation_hours: Some(12),
            is_active: true,
        }
    }

    #[test]
    fn lookups_are_scoped_by_business() {
        let catalog = Catalog::new();
        let a = business();
        let b = Business { id: Ulid::new(), slug: "other".into(), ..a.clone() };
        catalog.apply(&Event::BusinessRegistered(a.clone()));
        catalog.apply(&Event::BusinessRegistered(b.clone()));

        let staff = StaffMember {
            id: Ulid::new(),
            business_id: a.id,
            name: "Ana".into(),
            is_active: true,
        };
        catalog.apply(&Event::StaffAdded(staff.clone()));

        assert_eq!(catalog.staff_member(a.id, staff.id).unwrap(), staff);
        assert!(matches!(catalog.staff_member(b.id, staff.id), Err(EngineError::NotFound(_))));
        assert_eq!(catalog.business_by_slug("other").unwrap().id, b.id);
        assert_eq!(catalog.cancellation_hours(a.id), Some(12));
    }

    #[test]
    fn inactive_entities_are_hidden_from_active_lookups() {
        let catalog = Catalog::new();
        let mut a = business();
        a.is_active = false;
        catalog.apply(&Event::BusinessRegistered(a.clone()));
        assert!(catalog.business(a.id).is_ok());
        assert!(catalog.active_business(a.id).is_err());
    }

    #[test]
    fn window_deactivation_and_resolution() {
        let catalog = Catalog::new();
        let a = business();
        catalog.apply(&Event::BusinessRegistered(a.clone()));
        let w = AvailabilityWindow {
            id: Ulid::new(),
            business_id: a.id,
            staff_id: None,
            day_of_week: 1,
            start_time: "09:00".parse().unwrap(),
            end_time: "17:00".parse().unwrap(),
            is_active: true,
        };
        catalog.apply(&Event::WindowSet(w.clone()));
        assert_eq!(catalog.resolve_window(a.id, None, 1), Some(w.clone()));

        catalog.apply(&Event::WindowDeactivated { id: w.id, business_id: a.id });
        assert!(catalog.resolve_window(a.id, None, 1).is_none());
        assert!(catalog.window_for_key(a.id, None, 1).is_some());
    }

    #[test]
    fn snapshot_rebuilds_identical_catalog() {
        let catalog = Catalog::new();
        let a = business();
        catalog.apply(&Event::BusinessRegistered(a.clone()));
        let svc = Service {
            id: Ulid::new(),
            business_id: a.id,
            name: "Cut".into(),
            duration_minutes: 45,
            price: 3_000,
            sort_order: 0,
            is_active: true,
            staff: vec![],
        };
        catalog.apply(&Event::ServiceDefined(svc.clone()));

        let rebuilt = Catalog::new();
        for e in catalog.snapshot_events() {
            rebuilt.apply(&e);
        }
        assert_eq!(rebuilt.service(a.id, svc.id).unwrap(), svc);
        assert_eq!(rebuilt.business(a.id).unwrap(), a);
    }
}
