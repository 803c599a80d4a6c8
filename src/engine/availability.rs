use crate::model::*;

// ── Free-interval algebra ─────────────────────────────────────────

/// Open stretches of one day: the window minus every blocked and booked span.
///
/// `blocked` and `booked` may be unsorted and overlapping. No window means no
/// open time at all.
pub fn open_intervals(window: Option<Span>, blocked: &[Span], booked: &[Span]) -> Vec<Span> {
    let Some(window) = window else {
        return Vec::new();
    };
    let mut free = vec![window];

    let taken = normalize(blocked.iter().chain(booked).copied().collect());
    if !taken.is_empty() {
        free = subtract_intervals(&free, &taken);
    }
    free
}

/// Sort and merge into disjoint spans.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// `base` minus `to_remove`. Both must be sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut first_relevant = 0;

    for &b in base {
        let mut cursor = b.start;

        while first_relevant < to_remove.len() && to_remove[first_relevant].end <= cursor {
            first_relevant += 1;
        }

        for r in to_remove[first_relevant..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Minute = 60;

    fn s(start: Minute, end: Minute) -> Span {
        Span::new(start, end)
    }

    #[test]
    fn merge_joins_overlapping_and_adjacent() {
        let merged = merge_overlapping(&[s(0, 60), s(30, 90), s(90, 120), s(200, 260)]);
        assert_eq!(merged, vec![s(0, 120), s(200, 260)]);
    }

    #[test]
    fn normalize_handles_unsorted_input() {
        let merged = normalize(vec![s(200, 260), s(0, 60), s(50, 70)]);
        assert_eq!(merged, vec![s(0, 70), s(200, 260)]);
    }

    #[test]
    fn subtract_splits_base() {
        let result = subtract_intervals(&[s(9 * H, 17 * H)], &[s(12 * H, 13 * H)]);
        assert_eq!(result, vec![s(9 * H, 12 * H), s(13 * H, 17 * H)]);
    }

    #[test]
    fn subtract_everything_leaves_nothing() {
        let result = subtract_intervals(&[s(9 * H, 10 * H)], &[s(8 * H, 11 * H)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_across_multiple_bases() {
        let result = subtract_intervals(
            &[s(0, 100), s(200, 300)],
            &[s(50, 250)],
        );
        assert_eq!(result, vec![s(0, 50), s(250, 300)]);
    }

    #[test]
    fn open_intervals_without_window_is_empty() {
        assert!(open_intervals(None, &[], &[]).is_empty());
    }

    #[test]
    fn open_intervals_subtracts_blocks_and_bookings() {
        let open = open_intervals(
            Some(s(9 * H, 17 * H)),
            &[s(12 * H, 13 * H)],
            &[s(9 * H, 10 * H), s(16 * H + 30, 17 * H)],
        );
        assert_eq!(
            open,
            vec![s(10 * H, 12 * H), s(13 * H, 16 * H + 30)]
        );
    }
}
