//! Duplicate suppression.
//!
//! Many sources report values that rarely change (a process's virtual memory size, an endpoint's
//! response code). Sending the same value for the same series over and over costs bandwidth and
//! storage on the remote side without adding information, so the ingestor remembers the last value
//! it admitted for each series and suppresses unchanged repeats for a configurable window.
//!
//! ## Fixed and sliding windows
//!
//! With a [`DedupWindow::Fixed`] window, a suppressed repeat does not refresh the remembered
//! observation: a long run of identical values is let through again once the window has passed
//! since the *first* admission, which guarantees the remote side sees a fresh point at least once
//! per window. With a [`DedupWindow::Sliding`] window, every suppressed repeat pushes the window
//! forward, so an unchanging series is only re-admitted once it has been quiet for a whole window.
use std::{collections::HashMap, time::Duration};

use quanta::Instant;
use serde::Deserialize;

use crate::datapoint::{DataPoint, Value};

/// How the dedup window is anchored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupWindow {
    /// The window starts at the admission of the remembered value and is not extended by repeats.
    #[default]
    Fixed,

    /// Every suppressed repeat restarts the window.
    Sliding,
}

struct SentValue {
    observed: Instant,
    value: Value,
    timestamp: i64,
}

/// The last admitted value of every series, keyed by dedup key.
pub(crate) struct SentCache {
    window: Duration,
    mode: DedupWindow,
    sweep_enabled: bool,
    last_sweep: Option<Instant>,
    entries: HashMap<String, SentValue>,
}

impl SentCache {
    /// Creates a new `SentCache`.
    ///
    /// A zero `window` disables deduplication entirely, and nothing is remembered.
    pub fn new(window: Duration, mode: DedupWindow, sweep_enabled: bool) -> Self {
        SentCache { window, mode, sweep_enabled, last_sweep: None, entries: HashMap::new() }
    }

    fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Number of remembered series.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Decides whether a freshly produced point should be admitted.
    ///
    /// Returns `false` if the point repeats the remembered value of its series within the window.
    /// Otherwise the point becomes the remembered value and `true` is returned. The caller must
    /// only call this once it is certain the point will be queued if admitted.
    pub fn admit_fresh(&mut self, point: &DataPoint, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let window = self.window;
        let key = point.dedup_key();
        if let Some(prev) = self.entries.get_mut(&key) {
            if prev.value == point.value() && now.saturating_duration_since(prev.observed) < window {
                if self.mode == DedupWindow::Sliding {
                    prev.observed = now;
                }
                return false;
            }
        }

        self.entries.insert(
            key,
            SentValue { observed: now, value: point.value(), timestamp: point.timestamp() },
        );
        true
    }

    /// Decides whether a point restored after a failed delivery should be admitted again.
    ///
    /// A restored point was already admitted once, so its own entry must not suppress it. It is
    /// only suppressed by a newer observation of the same value within the window. The cache is
    /// never updated, as the remembered entry is at least as recent as the restored point.
    pub fn admit_restored(&self, point: &DataPoint, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }

        match self.entries.get(&point.dedup_key()) {
            Some(prev) => {
                let suppressed = prev.value == point.value()
                    && now.saturating_duration_since(prev.observed) < self.window
                    && prev.timestamp > point.timestamp();
                !suppressed
            }
            None => true,
        }
    }

    /// Removes entries that have fallen out of the window, at most once per window length.
    ///
    /// An entry outside the window can never suppress a point again, so removing it does not
    /// change any admission decision. Returns the number of entries removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        if !self.sweep_enabled || !self.is_enabled() {
            return 0;
        }
        if let Some(last) = self.last_sweep {
            if now.saturating_duration_since(last) < self.window {
                return 0;
            }
        }
        self.last_sweep = Some(now);

        let window = self.window;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now.saturating_duration_since(entry.observed) < window);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::{DedupWindow, SentCache};
    use crate::datapoint::{DataPoint, TagSet};

    fn point(value: i64, timestamp: i64) -> DataPoint {
        DataPoint::new("linux.proc.mem.virtual", timestamp, value, TagSet::new().with("name", "db"))
            .unwrap()
    }

    #[test]
    fn repeats_inside_window_are_suppressed() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Fixed, true);

        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
        mock.increment(Duration::from_secs(59));
        assert!(!cache.admit_fresh(&point(10, 59), clock.now()));
        mock.increment(Duration::from_secs(2));
        assert!(cache.admit_fresh(&point(10, 61), clock.now()));
    }

    #[test]
    fn changed_values_bypass_the_window() {
        let (clock, _mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Fixed, true);

        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
        assert!(cache.admit_fresh(&point(11, 0), clock.now()));
        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
    }

    #[test]
    fn fixed_window_is_anchored_on_first_admission() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Fixed, true);

        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
        mock.increment(Duration::from_secs(25));
        assert!(!cache.admit_fresh(&point(10, 25), clock.now()));
        mock.increment(Duration::from_secs(25));
        assert!(!cache.admit_fresh(&point(10, 50), clock.now()));
        mock.increment(Duration::from_secs(25));
        assert!(cache.admit_fresh(&point(10, 75), clock.now()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sliding_window_is_extended_by_repeats() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Sliding, true);

        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
        for _ in 0..5 {
            mock.increment(Duration::from_secs(25));
            assert!(!cache.admit_fresh(&point(10, 0), clock.now()));
        }
        mock.increment(Duration::from_secs(61));
        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
    }

    #[test]
    fn zero_window_disables_dedup() {
        let (clock, _mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::ZERO, DedupWindow::Fixed, true);

        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
        assert!(cache.admit_fresh(&point(10, 0), clock.now()));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn restored_points_are_not_suppressed_by_their_own_entry() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Fixed, true);

        let original = point(10, 100);
        assert!(cache.admit_fresh(&original, clock.now()));
        mock.increment(Duration::from_secs(5));
        assert!(cache.admit_restored(&original, clock.now()));
    }

    #[test]
    fn restored_points_are_suppressed_by_newer_observations() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Fixed, true);

        let original = point(10, 100);
        assert!(cache.admit_fresh(&original, clock.now()));
        mock.increment(Duration::from_secs(61));
        assert!(cache.admit_fresh(&point(10, 161), clock.now()));
        mock.increment(Duration::from_secs(5));

        assert!(!cache.admit_restored(&original, clock.now()));
        // A different value is never a duplicate.
        assert!(cache.admit_restored(&point(9, 100), clock.now()));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(60), DedupWindow::Fixed, true);

        let old = DataPoint::new("old", 0, 1, TagSet::new()).unwrap();
        let recent = DataPoint::new("recent", 0, 1, TagSet::new()).unwrap();

        assert_eq!(cache.sweep(clock.now()), 0);
        assert!(cache.admit_fresh(&old, clock.now()));
        mock.increment(Duration::from_secs(30));
        assert!(cache.admit_fresh(&recent, clock.now()));

        mock.increment(Duration::from_secs(31));
        assert_eq!(cache.sweep(clock.now()), 1);
        assert_eq!(cache.len(), 1);

        mock.increment(Duration::from_secs(60));
        assert_eq!(cache.sweep(clock.now()), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_can_be_disabled() {
        let (clock, mock) = Clock::mock();
        let mut cache = SentCache::new(Duration::from_secs(1), DedupWindow::Fixed, false);

        assert!(cache.admit_fresh(&point(1, 0), clock.now()));
        mock.increment(Duration::from_secs(10));
        assert_eq!(cache.sweep(clock.now()), 0);
        assert_eq!(cache.len(), 1);
    }
}
