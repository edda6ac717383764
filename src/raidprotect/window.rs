use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Join timestamps of one guild, oldest first.
///
/// Holds only joins strictly younger than the window; the length after
/// [`JoinWindow::record`] is the number of joins in `(now - window, now]`.
#[derive(Debug, Default)]
pub struct JoinWindow {
    joins: VecDeque<Instant>,
}

impl JoinWindow {
    pub fn new() -> Self {
        Self {
            joins: VecDeque::with_capacity(32),
        }
    }

    /// Drops expired entries, appends `now`, returns the count in the window.
    pub fn record(&mut self, now: Instant, window: Duration) -> usize {
        prune_older_than(&mut self.joins, window, now);
        self.joins.push_back(now);
        self.joins.len()
    }

    /// Count as of `now` without recording anything.
    pub fn count(&self, now: Instant, window: Duration) -> usize {
        self.joins
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn oldest(&self) -> Option<Instant> {
        self.joins.front().copied()
    }

    /// Forgets every recorded join.
    pub fn clear(&mut self) {
        self.joins.clear();
    }
}

fn prune_older_than(q: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&front) = q.front() {
        if now.saturating_duration_since(front) >= window {
            q.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const W: Duration = Duration::from_secs(5);

    #[test]
    fn counts_joins_inside_window() {
        let t0 = Instant::now();
        let mut w = JoinWindow::new();
        assert_eq!(w.record(t0, W), 1);
        assert_eq!(w.record(t0 + Duration::from_secs(1), W), 2);
        assert_eq!(w.record(t0 + Duration::from_secs(4), W), 3);
        // t0 is exactly one window old at t0+5s and drops out
        assert_eq!(w.record(t0 + Duration::from_secs(5), W), 3);
        assert_eq!(w.oldest(), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn clear_restarts_the_count() {
        let t0 = Instant::now();
        let mut w = JoinWindow::new();
        w.record(t0, W);
        w.record(t0, W);
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.record(t0 + Duration::from_millis(10), W), 1);
    }

    #[test]
    fn long_gap_empties_window() {
        let t0 = Instant::now();
        let mut w = JoinWindow::new();
        for i in 0..8 {
            w.record(t0 + Duration::from_millis(i * 100), W);
        }
        assert_eq!(w.len(), 8);
        assert_eq!(w.record(t0 + Duration::from_secs(60), W), 1);
    }

    #[test]
    fn count_does_not_mutate() {
        let t0 = Instant::now();
        let mut w = JoinWindow::new();
        w.record(t0, W);
        w.record(t0 + Duration::from_secs(3), W);
        assert_eq!(w.count(t0 + Duration::from_secs(6), W), 1);
        assert_eq!(w.len(), 2);
    }

    proptest! {
        #[test]
        fn window_matches_brute_force(gaps in proptest::collection::vec(0u64..3_000, 1..60)) {
            let t0 = Instant::now();
            let mut w = JoinWindow::new();
            let mut seen: Vec<Instant> = Vec::new();
            let mut now = t0;
            for gap in gaps {
                now += Duration::from_millis(gap);
                seen.push(now);
                let count = w.record(now, W);
                let expected = seen
                    .iter()
                    .filter(|t| now.duration_since(**t) < W)
                    .count();
                prop_assert_eq!(count, expected);
                if let Some(oldest) = w.oldest() {
                    prop_assert!(now.duration_since(oldest) < W);
                }
                let ordered = w.joins.iter().zip(w.joins.iter().skip(1)).all(|(a, b)| a <= b);
                prop_assert!(ordered);
            }
        }
    }
}
