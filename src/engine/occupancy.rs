use crate::model::*;

// ── Occupancy Algorithm ─────────────────────────────────────────

/// A maximal run of constant, non-zero reserved load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub span: Span,
    pub load: u32,
}

/// Sweep-line over weighted footprints: +qty at start, -qty at end.
///
/// Returns disjoint segments sorted by start, each carrying the total reserved
/// quantity over it. Ends sort before starts at the same instant, so touching
/// footprints never stack (half-open ranges).
pub fn load_profile(footprints: &[(Span, u32)]) -> Vec<LoadSegment> {
    if footprints.is_empty() {
        return Vec::new();
    }

    let mut events: Vec<(Ms, i64)> = Vec::with_capacity(footprints.len() * 2);
    for (span, qty) in footprints {
        events.push((span.start, i64::from(*qty)));
        events.push((span.end, -i64::from(*qty)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut profile: Vec<LoadSegment> = Vec::new();
    let mut load: i64 = 0;
    let mut cursor = events[0].0;

    for (time, delta) in events {
        if time > cursor && load > 0 {
            let load = load as u32;
            match profile.last_mut() {
                // Coalesce with the previous run when the load did not change.
                Some(last) if last.span.end == cursor && last.load == load => last.span.end = time,
                _ => profile.push(LoadSegment {
                    span: Span::new(cursor, time),
                    load,
                }),
            }
        }
        cursor = time;
        load += delta;
    }

    profile
}

/// Highest load over any instant of `window`. Zero when nothing overlaps.
pub fn peak_load(profile: &[LoadSegment], window: &Span) -> u32 {
    let first = profile.partition_point(|s| s.span.end <= window.start);
    profile[first..]
        .iter()
        .take_while(|s| s.span.start < window.end)
        .map(|s| s.load)
        .max()
        .unwrap_or(0)
}

/// Lazy, restartable walk over consecutive calendar slots.
///
/// Built once from a load profile; each step only advances a cursor, so the
/// whole range costs O(segments + slots). Clone it to restart.
#[derive(Debug, Clone)]
pub struct Calendar {
    profile: Vec<LoadSegment>,
    capacity: u32,
    exclusive: bool,
    next_start: Ms,
    range_end: Ms,
    step: Ms,
    cursor: usize,
}

impl Calendar {
    pub fn new(
        profile: Vec<LoadSegment>,
        capacity: u32,
        exclusive: bool,
        range: Span,
        step: Ms,
    ) -> Self {
        debug_assert!(step > 0);
        Self {
            profile,
            capacity,
            exclusive,
            next_start: range.start,
            range_end: range.end,
            step,
            cursor: 0,
        }
    }

    pub fn slot_count(range: &Span, step: Ms) -> usize {
        ((range.duration_ms() + step - 1) / step) as usize
    }
}

impl Iterator for Calendar {
    type Item = AvailabilitySlot;

    fn next(&mut self) -> Option<AvailabilitySlot> {
        if self.next_start >= self.range_end {
            return None;
        }
        let slot = Span::new(
            self.next_start,
            (self.next_start + self.step).min(self.range_end),
        );
        self.next_start = slot.end;

        while self.cursor < self.profile.len() && self.profile[self.cursor].span.end <= slot.start {
            self.cursor += 1;
        }
        let reserved = self.profile[self.cursor..]
            .iter()
            .take_while(|s| s.span.start < slot.end)
            .map(|s| s.load)
            .max()
            .unwrap_or(0);

        Some(AvailabilitySlot::new(
            slot,
            self.capacity,
            reserved,
            self.exclusive,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next_start >= self.range_end {
            0
        } else {
            Self::slot_count(&Span::new(self.next_start, self.range_end), self.step)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Calendar {}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Ms = DAY_MS;

    fn seg(start: Ms, end: Ms, load: u32) -> LoadSegment {
        LoadSegment {
            span: Span::new(start, end),
            load,
        }
    }

    // ── load_profile ─────────────────────────────────────

    #[test]
    fn profile_empty() {
        assert!(load_profile(&[]).is_empty());
    }

    #[test]
    fn profile_single() {
        let p = load_profile(&[(Span::new(100, 200), 3)]);
        assert_eq!(p, vec![seg(100, 200, 3)]);
    }

    #[test]
    fn profile_overlap_stacks() {
        let p = load_profile(&[(Span::new(0, 100), 2), (Span::new(50, 150), 3)]);
        assert_eq!(p, vec![seg(0, 50, 2), seg(50, 100, 5), seg(100, 150, 3)]);
    }

    #[test]
    fn profile_adjacent_does_not_stack() {
        let p = load_profile(&[(Span::new(0, 100), 4), (Span::new(100, 200), 4)]);
        assert_eq!(p, vec![seg(0, 200, 4)]);
    }

    #[test]
    fn profile_gap_is_dropped() {
        let p = load_profile(&[(Span::new(0, 100), 1), (Span::new(300, 400), 2)]);
        assert_eq!(p, vec![seg(0, 100, 1), seg(300, 400, 2)]);
    }

    #[test]
    fn profile_nested() {
        let p = load_profile(&[
            (Span::new(0, 1000), 1),
            (Span::new(100, 200), 1),
            (Span::new(150, 175), 1),
        ]);
        assert_eq!(
            p,
            vec![
                seg(0, 100, 1),
                seg(100, 150, 2),
                seg(150, 175, 3),
                seg(175, 200, 2),
                seg(200, 1000, 1),
            ]
        );
    }

    // ── peak_load ────────────────────────────────────────

    #[test]
    fn peak_inside_and_outside() {
        let p = load_profile(&[(Span::new(0, 100), 2), (Span::new(50, 150), 3)]);
        assert_eq!(peak_load(&p, &Span::new(0, 40)), 2);
        assert_eq!(peak_load(&p, &Span::new(0, 200)), 5);
        assert_eq!(peak_load(&p, &Span::new(100, 200)), 3);
        assert_eq!(peak_load(&p, &Span::new(150, 200)), 0);
        assert_eq!(peak_load(&p, &Span::new(-50, 0)), 0);
    }

    // ── Calendar ─────────────────────────────────────────

    #[test]
    fn calendar_day_slots() {
        // qty 2 on days 0..3, qty 3 on days 5..7
        let p = load_profile(&[(Span::new(0, 3 * D), 2), (Span::new(5 * D, 7 * D), 3)]);
        let slots: Vec<_> = Calendar::new(p, 5, false, Span::new(0, 10 * D), D).collect();
        assert_eq!(slots.len(), 10);
        let reserved: Vec<u32> = slots.iter().map(|s| s.reserved_quantity).collect();
        assert_eq!(reserved, vec![2, 2, 2, 0, 0, 3, 3, 0, 0, 0]);
        assert!(slots.iter().all(|s| s.available_quantity == 5 - s.reserved_quantity));
    }

    #[test]
    fn calendar_last_slot_is_clipped() {
        let cal = Calendar::new(Vec::new(), 1, false, Span::new(0, D + D / 2), D);
        assert_eq!(cal.len(), 2);
        let slots: Vec<_> = cal.collect();
        assert_eq!(slots[1].span, Span::new(D, D + D / 2));
    }

    #[test]
    fn calendar_partial_day_uses_peak() {
        // Two back-to-back half-day rentals of 3 units each on a capacity-5 item:
        // never more than 3 out at once.
        let p = load_profile(&[
            (Span::new(0, D / 2), 3),
            (Span::new(D / 2, D), 3),
        ]);
        let slot = Calendar::new(p, 5, false, Span::new(0, D), D).next().unwrap();
        assert_eq!(slot.reserved_quantity, 3);
        assert_eq!(slot.available_quantity, 2);
    }

    #[test]
    fn calendar_exclusive_service_blocks_whole_slot() {
        let p = load_profile(&[(Span::new(0, D / 4), 1)]);
        let slot = Calendar::new(p, 4, true, Span::new(0, D), D).next().unwrap();
        assert_eq!(slot.available_quantity, 0);
        assert!(slot.is_fully_booked);
    }

    #[test]
    fn calendar_is_restartable() {
        let p = load_profile(&[(Span::new(D, 2 * D), 1)]);
        let cal = Calendar::new(p, 2, false, Span::new(0, 3 * D), D);
        let first: Vec<_> = cal.clone().collect();
        let second: Vec<_> = cal.collect();
        assert_eq!(first, second);
    }
}
