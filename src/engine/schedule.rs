use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

/// Read access to the recurring schedule and closures of a business.
///
/// The slot generator and allocator only see the catalog through this seam.
pub trait ScheduleSource {
    /// The window governing `staff_id` (or the business default) on a weekday.
    fn resolve_window(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        day_of_week: u8,
    ) -> Option<AvailabilityWindow>;

    /// Time-off blocks applying to `staff_id` that overlap `[start, end)`.
    /// Business-wide blocks always apply.
    fn time_offs_overlapping(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Vec<TimeOffBlock>;
}

/// Staff-specific override first, then the business default.
/// Inactive windows never resolve.
pub fn pick_window<'a>(
    windows: impl IntoIterator<Item = &'a AvailabilityWindow>,
    staff_id: Option<Ulid>,
    day_of_week: u8,
) -> Option<&'a AvailabilityWindow> {
    let mut fallback = None;
    for w in windows {
        if !w.is_active || w.day_of_week != day_of_week {
            continue;
        }
        match (staff_id, w.staff_id) {
            (Some(wanted), Some(owner)) if wanted == owner => return Some(w),
            (_, None) if fallback.is_none() => fallback = Some(w),
            _ => {}
        }
    }
    fallback
}

/// Blocks that apply to `staff_id` and overlap `[start, end)`.
///
/// A business-level query (`staff_id = None`) sees only business-wide blocks.
pub fn select_time_offs<'a>(
    blocks: impl IntoIterator<Item = &'a TimeOffBlock>,
    staff_id: Option<Ulid>,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<TimeOffBlock> {
    blocks
        .into_iter()
        .filter(|b| b.staff_id.is_none() || b.staff_id == staff_id)
        .filter(|b| b.overlaps(start, end))
        .cloned()
        .collect()
}
