//! # Sliding Window Counter
//!
//! Counts events whose timestamps fall within a trailing duration from "now".
//! Timestamps are kept in arrival order and stale ones are dropped from the front
//! whenever the counter is touched, so memory stays proportional to the number of
//! events inside one window.
//!
//! The counter is approximate by construction: it assumes events arrive roughly in
//! time order. An out-of-order timestamp is still counted, and is only pruned once
//! every timestamp ahead of it has aged out.
//!
//! All instants come from `tokio::time`, so a paused test clock drives the window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A time-bounded event counter.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    window: Duration,
    events: VecDeque<Instant>,
}

impl SlidingWindowCounter {
    /// Creates an empty counter over the given trailing window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    /// The trailing window this counter covers.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records one event happening now.
    pub fn add(&mut self) {
        self.add_at(Instant::now());
    }

    /// Records one event at `timestamp`.
    pub fn add_at(&mut self, timestamp: Instant) {
        self.events.push_back(timestamp);
        self.prune(timestamp);
    }

    /// Number of events inside the window ending now.
    pub fn count(&mut self) -> usize {
        self.count_at(Instant::now())
    }

    /// Number of events inside the window ending at `now`.
    pub fn count_at(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }

    /// Events per second over the window ending now.
    pub fn rate_per_second(&mut self) -> f64 {
        self.rate_per_second_at(Instant::now())
    }

    /// Events per second over the window ending at `now`. An empty window yields 0.
    pub fn rate_per_second_at(&mut self, now: Instant) -> f64 {
        let count = self.count_at(now);
        let secs = self.window.as_secs_f64();
        if count == 0 || secs == 0.0 {
            0.0
        } else {
            count as f64 / secs
        }
    }

    /// The most recently recorded timestamp, if any survived pruning.
    pub fn last_seen(&self) -> Option<Instant> {
        self.events.back().copied()
    }

    // Drops every timestamp older than `now - window` from the front.
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(front) = self.events.front() {
            if *front < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_counts_zero() {
        let mut counter = SlidingWindowCounter::new(Duration::from_secs(10));
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.rate_per_second(), 0.0);
        assert!(counter.last_seen().is_none());
    }

    #[test]
    fn count_only_reflects_the_trailing_window() {
        let base = Instant::now();
        let mut counter = SlidingWindowCounter::new(Duration::from_secs(10));

        for offset in 0..5 {
            counter.add_at(base + Duration::from_secs(offset));
        }
        assert_eq!(counter.count_at(base + Duration::from_secs(4)), 5);

        // Events at 0s and 1s fall out once the window ends past 11s.
        assert_eq!(counter.count_at(base + Duration::from_millis(11_500)), 3);

        // Advancing a full window beyond the last event clears everything.
        assert_eq!(counter.count_at(base + Duration::from_secs(15)), 0);
    }

    #[test]
    fn boundary_event_is_still_inside_the_window() {
        let base = Instant::now();
        let mut counter = SlidingWindowCounter::new(Duration::from_secs(60));
        counter.add_at(base);
        assert_eq!(counter.count_at(base + Duration::from_secs(60)), 1);
        assert_eq!(counter.count_at(base + Duration::from_millis(60_001)), 0);
    }

    #[test]
    fn rate_divides_by_window_length() {
        let base = Instant::now();
        let mut counter = SlidingWindowCounter::new(Duration::from_secs(10));
        for _ in 0..25 {
            counter.add_at(base);
        }
        assert!((counter.rate_per_second_at(base) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_order_timestamps_are_tolerated() {
        let base = Instant::now();
        let mut counter = SlidingWindowCounter::new(Duration::from_secs(10));
        counter.add_at(base + Duration::from_secs(5));
        counter.add_at(base + Duration::from_secs(2));
        assert_eq!(counter.count_at(base + Duration::from_secs(6)), 2);
        assert_eq!(counter.last_seen(), Some(base + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_clock_drives_the_default_methods() {
        let mut counter = SlidingWindowCounter::new(Duration::from_secs(10));
        counter.add();
        counter.add();
        tokio::time::advance(Duration::from_secs(5)).await;
        counter.add();
        assert_eq!(counter.count(), 3);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(counter.count(), 1);
    }
}
