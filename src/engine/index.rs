use ulid::Ulid;

use crate::model::*;

/// One therapist's occupied intervals: active reservations plus every time
/// block, sorted by `span.start`.
///
/// Treated as a value. Mutations go through `with_*`/`without` which return a
/// new index, so a rejected decision never leaves a half-updated index behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityIndex {
    therapist_id: Ulid,
    intervals: Vec<Interval>,
}

impl AvailabilityIndex {
    pub fn new(therapist_id: Ulid) -> Self {
        Self {
            therapist_id,
            intervals: Vec::new(),
        }
    }

    /// Build from raw rows. Rows belonging to other therapists and
    /// reservations that are cancelled or completed are skipped.
    pub fn build<'a>(
        therapist_id: Ulid,
        reservations: impl IntoIterator<Item = &'a Reservation>,
        time_blocks: impl IntoIterator<Item = &'a TimeBlock>,
    ) -> Self {
        let mut intervals: Vec<Interval> = reservations
            .into_iter()
            .filter(|r| r.therapist_id == therapist_id && r.is_active())
            .map(Interval::from_reservation)
            .chain(
                time_blocks
                    .into_iter()
                    .filter(|b| b.therapist_id == therapist_id)
                    .map(Interval::from_time_block),
            )
            .collect();
        intervals.sort_by_key(|i| (i.span.start(), i.span.end()));
        Self {
            therapist_id,
            intervals,
        }
    }

    pub fn therapist_id(&self) -> Ulid {
        self.therapist_id
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn get(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start(), |i| i.span.start())
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// New index with `reservation` placed (or replaced, if already present).
    /// Reservations for another therapist or in a terminal state are only removed.
    pub fn with_reservation(&self, reservation: &Reservation) -> Self {
        let mut next = self.without(reservation.id);
        if reservation.therapist_id == self.therapist_id && reservation.is_active() {
            next.insert(Interval::from_reservation(reservation));
        }
        next
    }

    pub fn with_time_block(&self, block: &TimeBlock) -> Self {
        let mut next = self.without(block.id);
        if block.therapist_id == self.therapist_id {
            next.insert(Interval::from_time_block(block));
        }
        next
    }

    pub fn without(&self, id: Ulid) -> Self {
        let mut next = self.clone();
        next.remove(id);
        next
    }

    /// Entries whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start() < query.end());
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end() > query.start())
    }

    /// Owned copy of every entry overlapping `candidate`, tagged with origin.
    pub fn query(&self, candidate: &Span) -> Vec<Interval> {
        self.overlapping(candidate).cloned().collect()
    }

    /// Occupied time inside `window`, clamped to it. Touching or colliding
    /// entries (a booking under a break, say) come back as one span, so the
    /// result is disjoint and start-sorted.
    pub fn occupied(&self, window: &Span) -> Vec<Span> {
        let mut busy: Vec<Span> = Vec::new();
        for interval in self.overlapping(window).filter(|i| i.is_blocking()) {
            // Clamping keeps starts non-decreasing, so only the last span can absorb this one.
            let start = interval.span.start().max(window.start());
            let end = interval.span.end().min(window.end());
            match busy.last_mut() {
                Some(last) if start <= last.end() => {
                    *last = Span::from_ordered(last.start(), last.end().max(end));
                }
                _ => busy.push(Span::from_ordered(start, end)),
            }
        }
        busy
    }

    /// Gaps inside `window` not covered by any entry, dropping gaps shorter
    /// than `min_duration`.
    pub fn free_slots(&self, window: &Span, min_duration: Option<Ms>) -> Vec<Span> {
        let mut free = Vec::new();
        let mut cursor = window.start();
        for busy in self.occupied(window) {
            if busy.start() > cursor {
                free.push(Span::from_ordered(cursor, busy.start()));
            }
            cursor = busy.end();
        }
        if cursor < window.end() {
            free.push(Span::from_ordered(cursor, window.end()));
        }
        if let Some(min) = min_duration {
            free.retain(|s| s.duration_ms() >= min);
        }
        free
    }

    /// Every pair of blocking entries that overlap, as `(earlier, later)` ids.
    /// Empty for any index produced solely by accepted scheduler decisions;
    /// time blocks placed over existing reservations show up here.
    pub fn overlapping_pairs(&self) -> Vec<(Ulid, Ulid)> {
        let blocking: Vec<&Interval> = self.intervals.iter().filter(|i| i.is_blocking()).collect();
        let mut pairs = Vec::new();
        for (i, a) in blocking.iter().enumerate() {
            for b in &blocking[i + 1..] {
                // Sorted by start: once b starts at/after a ends, nothing later overlaps a.
                if b.span.start() >= a.span.end() {
                    break;
                }
                pairs.push((a.id, b.id));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    fn booked(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: span(start, end),
            kind: IntervalKind::Booked(ReservationStatus::Confirmed),
        }
    }

    fn blocked(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: span(start, end),
            kind: IntervalKind::Blocked(TimeBlockKind::Break),
        }
    }

    fn reservation(therapist_id: Ulid, start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            therapist_id,
            span: span(start, end),
            status,
            notes: None,
            total_price: 0,
        }
    }

    fn time_block(therapist_id: Ulid, start: Ms, end: Ms, kind: TimeBlockKind) -> TimeBlock {
        TimeBlock {
            id: Ulid::new(),
            therapist_id,
            span: span(start, end),
            kind,
            reason: None,
        }
    }

    #[test]
    fn build_keeps_only_active_reservations_for_the_therapist() {
        let t = Ulid::new();
        let other = Ulid::new();
        let reservations = vec![
            reservation(t, 300, 400, ReservationStatus::Confirmed),
            reservation(t, 100, 200, ReservationStatus::Pending),
            reservation(t, 500, 600, ReservationStatus::Cancelled),
            reservation(t, 700, 800, ReservationStatus::Completed),
            reservation(other, 100, 200, ReservationStatus::Confirmed),
        ];
        let blocks = vec![
            time_block(t, 200, 300, TimeBlockKind::Vacation),
            time_block(other, 0, 1000, TimeBlockKind::SickLeave),
        ];

        let index = AvailabilityIndex::build(t, &reservations, &blocks);
        assert_eq!(index.len(), 3);
        let starts: Vec<Ms> = index.intervals().iter().map(|i| i.span.start()).collect();
        assert_eq!(starts, vec![100, 200, 300]);
        assert!(index.get(reservations[2].id).is_none());
        assert!(index.get(reservations[4].id).is_none());
    }

    #[test]
    fn interval_ordering() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(booked(300, 400));
        index.insert(blocked(100, 200));
        index.insert(booked(200, 300));
        let starts: Vec<Ms> = index.intervals().iter().map(|i| i.span.start()).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        let entries: Vec<Interval> = (0..3).map(|i| booked(i * 100, i * 100 + 50)).collect();
        for e in &entries {
            index.insert(e.clone());
        }
        index.remove(entries[1].id);
        assert_eq!(index.len(), 2);
        assert_eq!(index.intervals()[0].id, entries[0].id);
        assert_eq!(index.intervals()[1].id, entries[2].id);
        assert!(index.remove(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(booked(100, 200));
        index.insert(blocked(450, 600));
        index.insert(booked(1000, 1100));

        let hits: Vec<_> = index.overlapping(&span(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, span(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(booked(100, 200));
        assert!(index.query(&span(200, 300)).is_empty());
        assert!(index.query(&span(0, 100)).is_empty());
    }

    #[test]
    fn overlapping_large_interval_spanning_query() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(blocked(0, 10_000));
        assert_eq!(index.query(&span(500, 600)).len(), 1);
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(booked(100, 201));
        assert_eq!(index.query(&span(200, 300)).len(), 1);
    }

    #[test]
    fn query_tags_origin() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        let r = booked(100, 200);
        let b = blocked(150, 250);
        index.insert(r.clone());
        index.insert(b.clone());
        let hits = index.query(&span(0, 1000));
        assert_eq!(hits, vec![r, b]);
        assert!(hits[0].is_reservation());
        assert!(hits[1].is_time_block());
    }

    #[test]
    fn with_reservation_is_a_new_value() {
        let t = Ulid::new();
        let index = AvailabilityIndex::new(t);
        let r = reservation(t, 100, 200, ReservationStatus::Pending);
        let next = index.with_reservation(&r);
        assert!(index.is_empty());
        assert_eq!(next.len(), 1);

        let mut moved = r.clone();
        moved.span = span(300, 400);
        let after_move = next.with_reservation(&moved);
        assert_eq!(after_move.len(), 1);
        assert_eq!(after_move.get(r.id).unwrap().span, span(300, 400));

        let mut cancelled = moved.clone();
        cancelled.status = ReservationStatus::Cancelled;
        assert!(after_move.with_reservation(&cancelled).is_empty());

        let mut elsewhere = moved;
        elsewhere.therapist_id = Ulid::new();
        assert!(after_move.with_reservation(&elsewhere).is_empty());
    }

    #[test]
    fn free_slots_subtract_occupied_time() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(booked(9 * HOUR, 10 * HOUR));
        index.insert(blocked(12 * HOUR, 13 * HOUR));
        index.insert(booked(12 * HOUR + 30 * MINUTE, 13 * HOUR + 15 * MINUTE));

        let day = span(8 * HOUR, 18 * HOUR);
        let free = index.free_slots(&day, None);
        assert_eq!(
            free,
            vec![
                span(8 * HOUR, 9 * HOUR),
                span(10 * HOUR, 12 * HOUR),
                span(13 * HOUR + 15 * MINUTE, 18 * HOUR),
            ]
        );

        let long_only = index.free_slots(&day, Some(90 * MINUTE));
        assert_eq!(long_only.len(), 2);
    }

    #[test]
    fn occupied_merges_touching_and_nested_entries() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(blocked(0, 1000));
        index.insert(booked(100, 200));
        index.insert(booked(1000, 1200));
        index.insert(booked(1500, 1600));
        index.insert(booked(1550, 1700));

        assert_eq!(
            index.occupied(&span(50, 1650)),
            vec![span(50, 1200), span(1500, 1650)]
        );
    }

    #[test]
    fn free_slots_between_colliding_entries() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        index.insert(booked(100, 300));
        index.insert(blocked(200, 250));
        index.insert(booked(280, 400));
        index.insert(booked(700, 900));

        assert_eq!(
            index.free_slots(&span(0, 800), None),
            vec![span(0, 100), span(400, 700)]
        );
        assert!(index.free_slots(&span(150, 350), None).is_empty());
    }

    #[test]
    fn free_slots_of_empty_index_is_whole_window() {
        let index = AvailabilityIndex::new(Ulid::new());
        let day = span(0, HOUR);
        assert_eq!(index.free_slots(&day, None), vec![day]);
    }

    #[test]
    fn overlapping_pairs_reports_collisions() {
        let mut index = AvailabilityIndex::new(Ulid::new());
        let a = booked(100, 200);
        let b = booked(200, 300);
        let c = blocked(250, 400);
        index.insert(a);
        index.insert(b.clone());
        index.insert(c.clone());
        assert_eq!(index.overlapping_pairs(), vec![(b.id, c.id)]);
    }
}
