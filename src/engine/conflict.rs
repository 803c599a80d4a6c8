use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, LaneLocks};

/// First non-cancelled booking in `lanes` overlapping `span`, other than `exclude`.
fn first_overlap<'a>(
    lanes: impl IntoIterator<Item = &'a LaneState>,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    lanes
        .into_iter()
        .flat_map(|lane| lane.active_overlapping(span))
        .find(|b| Some(b.id) != exclude)
}

/// Authoritative check, run while `locks` covers every lane `key` can conflict with.
///
/// A staffed booking only competes with its own lane; an unassigned one with
/// every lane of the day.
pub(super) fn find_conflict(
    locks: &LaneLocks,
    key: LaneKey,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    let hit = match key.lane {
        Lane::Staff(_) => first_overlap(locks.lane(key), span, exclude),
        Lane::Unassigned => first_overlap(locks.lanes_of_day(key.day), span, exclude),
    };
    hit.map(|b| b.id)
}

/// Reject the write if the lane is already at capacity.
pub(super) fn check_lane_capacity(locks: &LaneLocks, key: LaneKey) -> Result<(), super::EngineError> {
    let count = locks.lane(key).map_or(0, LaneState::active_count);
    if count >= MAX_BOOKINGS_PER_LANE {
        return Err(super::EngineError::LimitExceeded("too many bookings on this day"));
    }
    Ok(())
}

impl Engine {
    /// Keys of the lanes a query for `staff_id` on `date` must look at.
    fn relevant_lanes(&self, business_id: Ulid, staff_id: Option<Ulid>, date: NaiveDate) -> Vec<LaneKey> {
        let day = DayKey { business_id, date };
        match staff_id {
            Some(staff) => vec![LaneKey { day, lane: Lane::Staff(staff) }],
            None => self
                .lanes_of_day(day)
                .into_iter()
                .map(|lane| LaneKey { day, lane })
                .collect(),
        }
    }

    /// Non-cancelled bookings overlapping `span`, taking short shared reads.
    /// Advisory: the result may be stale by the time the caller acts on it.
    pub async fn bookings_overlapping(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Vec<Booking> {
        let mut hits = Vec::new();
        for key in self.relevant_lanes(business_id, staff_id, date) {
            let Some(lane) = self.existing_lane(key) else { continue };
            let guard = lane.read().await;
            hits.extend(
                guard
                    .active_overlapping(&span)
                    .filter(|b| Some(b.id) != exclude)
                    .cloned(),
            );
        }
        hits.sort_by_key(|b| (b.start_time, b.id));
        hits
    }

    pub async fn has_conflict(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
        span: Span,
        exclude: Option<Ulid>,
    ) -> bool {
        !self
            .bookings_overlapping(business_id, staff_id, date, span, exclude)
            .await
            .is_empty()
    }

    /// Spans of non-cancelled bookings relevant to a slot query.
    pub(super) async fn booked_spans(
        &self,
        business_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Vec<Span> {
        let mut spans = Vec::new();
        for key in self.relevant_lanes(business_id, staff_id, date) {
            let Some(lane) = self.existing_lane(key) else { continue };
            let guard = lane.read().await;
            spans.extend(guard.bookings.iter().filter(|b| b.is_active()).map(Booking::span));
        }
        spans
    }
}
