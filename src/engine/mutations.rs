use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Deserializer};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::slots::validate_date;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Deserialize)]
pub struct NewBusiness {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub cancellation_hours: Option<u32>,
}

/// Partial business update. An absent field keeps its value; a
/// `cancellation_hours` of `null` clears the cutoff.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusinessChanges {
    #[serde(default, deserialize_with = "present")]
    pub cancellation_hours: Option<Option<u32>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Maps a field that is present (even as `null`) to `Some`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub name: String,
    pub duration_minutes: u32,
    /// Minor currency units.
    pub price: i64,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub staff: Vec<Ulid>,
}

/// What a time-off block covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOffRange {
    /// Whole calendar days, both ends inclusive.
    AllDay { first: NaiveDate, last: NaiveDate },
    Between {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

#[derive(Debug, Clone)]
pub struct NewTimeOff {
    pub staff_id: Option<Ulid>,
    pub range: TimeOffRange,
    pub title: Option<String>,
}

// ── Input validation ─────────────────────────────────────

pub(super) fn validate_text(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(EngineError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn validate_slug(slug: &str) -> Result<(), EngineError> {
    validate_text("slug", slug, MAX_SLUG_LEN)?;
    let well_formed = slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !slug.starts_with('-')
        && !slug.ends_with('-');
    if !well_formed {
        return Err(EngineError::Validation(
            "slug may only contain lowercase letters, digits and inner dashes".into(),
        ));
    }
    Ok(())
}

pub(super) fn validate_customer(customer: &Customer) -> Result<(), EngineError> {
    validate_text("customer name", &customer.name, MAX_NAME_LEN)?;
    validate_text("customer email", &customer.email, MAX_EMAIL_LEN)?;
    let plausible = customer
        .email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !plausible {
        return Err(EngineError::Validation("customer email is not valid".into()));
    }
    if let Some(phone) = &customer.phone {
        validate_text("customer phone", phone, MAX_PHONE_LEN)?;
    }
    Ok(())
}

fn resolve_range(range: TimeOffRange) -> Result<(NaiveDateTime, NaiveDateTime, bool), EngineError> {
    let (start, end, all_day) = match range {
        TimeOffRange::AllDay { first, last } => {
            validate_date(first)?;
            validate_date(last)?;
            if last < first {
                return Err(EngineError::Validation("time off ends before it starts".into()));
            }
            let end = last
                .succ_opt()
                .ok_or_else(|| EngineError::Validation("time off date out of range".into()))?;
            (at_minute(first, 0), at_minute(end, 0), true)
        }
        TimeOffRange::Between { start, end } => {
            validate_date(start.date())?;
            validate_date(end.date())?;
            if end <= start {
                return Err(EngineError::Validation("time off must end after it starts".into()));
            }
            (start, end, false)
        }
    };
    if end - start > TimeDelta::days(MAX_TIME_OFF_DAYS) {
        return Err(EngineError::LimitExceeded("time off longer than a year"));
    }
    Ok((start, end, all_day))
}

// ── Catalog mutations ────────────────────────────────────

impl Engine {
    pub async fn register_business(&self, new: NewBusiness) -> Result<Business, EngineError> {
        validate_slug(&new.slug)?;
        validate_text("business name", &new.name, MAX_NAME_LEN)?;

        // Slugs are global, so registrations serialize on one key.
        let _guard = self.lock_catalog(Ulid::nil()).await;
        if let Some(existing) = self.catalog.business_by_slug(&new.slug) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        if self.catalog.business_count() >= MAX_BUSINESSES {
            return Err(EngineError::LimitExceeded("too many businesses"));
        }

        let business = Business {
            id: Ulid::new(),
            slug: new.slug,
            name: new.name.trim().to_string(),
            cancellation_hours: new.cancellation_hours.filter(|h| *h > 0),
            is_active: true,
        };
        self.commit_catalog(Event::BusinessRegistered(business.clone()))
            .await?;
        metrics::gauge!(crate::observability::BUSINESSES_ACTIVE).set(self.catalog.business_count() as f64);
        info!(business = %business.id, slug = %business.slug, "business registered");
        Ok(business)
    }

    /// Change the cancellation cutoff and whether the business takes bookings.
    pub async fn update_business(&self, business_id: Ulid, changes: BusinessChanges) -> Result<Business, EngineError> {
        let _guard = self.lock_catalog(business_id).await;
        let mut business = self.catalog.business(business_id)?;
        if let Some(hours) = changes.cancellation_hours {
            business.cancellation_hours = hours.filter(|h| *h > 0);
        }
        if let Some(active) = changes.is_active {
            business.is_active = active;
        }
        self.commit_catalog(Event::BusinessUpdated(business.clone()))
            .await?;
        Ok(business)
    }

    pub async fn add_staff(&self, business_id: Ulid, name: &str) -> Result<StaffMember, EngineError> {
        validate_text("staff name", name, MAX_NAME_LEN)?;
        let _guard = self.lock_catalog(business_id).await;
        self.catalog.active_business(business_id)?;
        if self.catalog.count_for(business_id).staff >= MAX_STAFF_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }

        let staff = StaffMember {
            id: Ulid::new(),
            business_id,
            name: name.trim().to_string(),
            is_active: true,
        };
        self.commit_catalog(Event::StaffAdded(staff.clone())).await?;
        Ok(staff)
    }

    pub async fn set_staff_active(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        is_active: bool,
    ) -> Result<StaffMember, EngineError> {
        let _guard = self.lock_catalog(business_id).await;
        let mut staff = self.catalog.staff_member(business_id, staff_id)?;
        if staff.is_active == is_active {
            return Ok(staff);
        }
        staff.is_active = is_active;
        self.commit_catalog(Event::StaffUpdated(staff.clone())).await?;
        Ok(staff)
    }

    pub async fn define_service(&self, business_id: Ulid, new: NewService) -> Result<Service, EngineError> {
        validate_text("service name", &new.name, MAX_NAME_LEN)?;
        let duration = i32::try_from(new.duration_minutes).unwrap_or(i32::MAX);
        super::slots::validate_duration(duration)?;
        if new.price < 0 {
            return Err(EngineError::Validation("price must not be negative".into()));
        }

        let _guard = self.lock_catalog(business_id).await;
        self.catalog.active_business(business_id)?;
        if self.catalog.count_for(business_id).services >= MAX_SERVICES_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let mut staff = new.staff;
        staff.sort();
        staff.dedup();
        for id in &staff {
            self.catalog.staff_member(business_id, *id)?;
        }

        let service = Service {
            id: Ulid::new(),
            business_id,
            name: new.name.trim().to_string(),
            duration_minutes: new.duration_minutes,
            price: new.price,
            sort_order: new.sort_order,
            is_active: true,
            staff,
        };
        self.commit_catalog(Event::ServiceDefined(service.clone()))
            .await?;
        Ok(service)
    }

    pub async fn set_service_active(
        &self,
        business_id: Ulid,
        service_id: Ulid,
        is_active: bool,
    ) -> Result<Service, EngineError> {
        let _guard = self.lock_catalog(business_id).await;
        let mut service = self.catalog.service(business_id, service_id)?;
        if service.is_active == is_active {
            return Ok(service);
        }
        service.is_active = is_active;
        self.commit_catalog(Event::ServiceUpdated(service.clone()))
            .await?;
        Ok(service)
    }

    /// Create or replace the window for (staff, weekday), reactivating it.
    pub async fn set_window(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        day_of_week: u8,
        start_time: ClockTime,
        end_time: ClockTime,
    ) -> Result<AvailabilityWindow, EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::Validation("day_of_week must be 0 (Sunday) to 6".into()));
        }
        if start_time >= end_time {
            return Err(EngineError::Validation("window must end after it starts".into()));
        }

        let _guard = self.lock_catalog(business_id).await;
        self.catalog.active_business(business_id)?;
        if let Some(staff_id) = staff_id {
            self.catalog.staff_member(business_id, staff_id)?;
        }

        let id = self
            .catalog
            .window_for_key(business_id, staff_id, day_of_week)
            .map_or_else(Ulid::new, |w| w.id);
        let window = AvailabilityWindow {
            id,
            business_id,
            staff_id,
            day_of_week,
            start_time,
            end_time,
            is_active: true,
        };
        self.commit_catalog(Event::WindowSet(window.clone())).await?;
        info!(business = %business_id, day_of_week, %start_time, %end_time, "window set");
        Ok(window)
    }

    pub async fn deactivate_window(
        &self,
        business_id: Ulid,
        window_id: Ulid,
    ) -> Result<AvailabilityWindow, EngineError> {
        let _guard = self.lock_catalog(business_id).await;
        let window = self.catalog.window(business_id, window_id)?;
        if window.is_active {
            self.commit_catalog(Event::WindowDeactivated {
                id: window_id,
                business_id,
            })
            .await?;
        }
        self.catalog.window(business_id, window_id)
    }

    pub async fn add_time_off(&self, business_id: Ulid, new: NewTimeOff) -> Result<TimeOffBlock, EngineError> {
        let (start, end, is_all_day) = resolve_range(new.range)?;
        let title = new.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        if let Some(title) = &title {
            validate_text("title", title, MAX_TITLE_LEN)?;
        }

        let _guard = self.lock_catalog(business_id).await;
        self.catalog.active_business(business_id)?;
        if let Some(staff_id) = new.staff_id {
            self.catalog.staff_member(business_id, staff_id)?;
        }
        if self.catalog.count_for(business_id).time_offs >= MAX_TIME_OFFS_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many time-off blocks"));
        }

        let block = TimeOffBlock {
            id: Ulid::new(),
            business_id,
            staff_id: new.staff_id,
            start,
            end,
            is_all_day,
            title,
        };
        self.commit_catalog(Event::TimeOffAdded(block.clone())).await?;
        info!(business = %business_id, staff = ?block.staff_id, start = %block.start, end = %block.end, "time off added");
        Ok(block)
    }

    pub async fn remove_time_off(&self, business_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let _guard = self.lock_catalog(business_id).await;
        self.catalog.time_off(business_id, id)?;
        self.commit_catalog(Event::TimeOffRemoved { id, business_id })
            .await
    }
}
