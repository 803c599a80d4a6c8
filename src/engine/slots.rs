use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::availability::normalize;

/// Candidate start times of one day, each flagged available or not.
///
/// Starts at the window open and steps by the granularity while the whole
/// service still fits before the window closes. A slot is unavailable when
/// `[t, t + duration)` overlaps a booked span or a time-off block.
#[derive(Debug, Clone)]
pub struct SlotIter {
    next: Minute,
    last_start: Minute,
    step: Minute,
    duration: Minute,
    /// Booked and blocked spans, merged and sorted.
    taken: Vec<Span>,
    closed: bool,
}

impl SlotIter {
    /// No window resolved for the day. Distinct from an open day with no room.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_free(&self, candidate: Span) -> bool {
        let first = self.taken.partition_point(|t| t.end <= candidate.start);
        self.taken
            .get(first)
            .is_none_or(|t| t.start >= candidate.end)
    }
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        if self.closed || self.next > self.last_start {
            return None;
        }
        let start = self.next;
        self.next += self.step;
        let time = ClockTime::from_minutes(start)?;
        Some(Slot {
            time,
            available: self.is_free(Span::new(start, start + self.duration)),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.closed || self.next > self.last_start {
            0
        } else {
            ((self.last_start - self.next) / self.step + 1) as usize
        };
        (remaining, Some(remaining))
    }
}

/// Minute spans of `date` covered by any of `blocks`.
pub fn blocked_spans(blocks: &[TimeOffBlock], date: NaiveDate) -> Vec<Span> {
    blocks.iter().filter_map(|b| b.span_on(date)).collect()
}

pub fn validate_granularity(granularity: Minute) -> Result<(), EngineError> {
    if !(MIN_GRANULARITY_MINUTES..=MAX_GRANULARITY_MINUTES).contains(&granularity) {
        return Err(EngineError::Validation(format!(
            "slot granularity must be between {MIN_GRANULARITY_MINUTES} and {MAX_GRANULARITY_MINUTES} minutes"
        )));
    }
    Ok(())
}

pub fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(EngineError::Validation(format!(
            "date {date} is outside the years {MIN_YEAR} to {MAX_YEAR}"
        )));
    }
    Ok(())
}

pub fn validate_duration(duration: Minute) -> Result<(), EngineError> {
    if duration <= 0 || duration > MAX_DURATION_MINUTES {
        return Err(EngineError::Validation(format!(
            "service duration must be between 1 and {MAX_DURATION_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Build the slot grid for one service on one date. Pure and restartable.
///
/// `booked` are the spans of non-cancelled bookings relevant to the query;
/// `time_offs` are projected onto `date` here.
pub fn generate_slots(
    window: Option<&AvailabilityWindow>,
    duration: Minute,
    booked: &[Span],
    time_offs: &[TimeOffBlock],
    date: NaiveDate,
    granularity: Minute,
) -> Result<SlotIter, EngineError> {
    validate_duration(duration)?;
    validate_granularity(granularity)?;

    let Some(window) = window else {
        return Ok(SlotIter {
            next: 0,
            last_start: -1,
            step: granularity,
            duration,
            taken: Vec::new(),
            closed: true,
        });
    };

    let mut taken = blocked_spans(time_offs, date);
    taken.extend_from_slice(booked);

    Ok(SlotIter {
        next: window.start_time.minutes(),
        last_start: window.end_time.minutes() - duration,
        step: granularity,
        duration,
        taken: normalize(taken),
        closed: false,
    })
}
