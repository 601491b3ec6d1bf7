//! In-process sliding windows.
//!
//! This is the fallback used whenever the distributed store cannot answer.
//! Each key holds a FIFO of admission timestamps. A check and the mutation it
//! implies happen under the key's map shard lock, so two concurrent checks can
//! never both take the last free slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use super::key::WindowKey;

pub(crate) const MICROS_PER_SEC: i64 = 1_000_000;

/// Extra seconds an idle window survives past its length before the sweep
/// may drop it. Mirrors the `window + 1` TTL used in the distributed store.
pub(crate) const GRACE_SECS: u64 = 1;

/// Seconds until the oldest admission leaves the window.
///
/// Rounded up and clamped to `[1, window_secs]` so a denied caller is never
/// told to retry immediately, nor later than one full window.
pub(crate) fn retry_after_secs(oldest: i64, now: i64, window_secs: u64) -> u64 {
    let until_exit = oldest.saturating_add(window_micros(window_secs)).saturating_sub(now);
    let secs = until_exit
        .saturating_add(MICROS_PER_SEC - 1)
        .div_euclid(MICROS_PER_SEC);
    let max = i64::try_from(window_secs.max(1)).unwrap_or(i64::MAX);
    secs.clamp(1, max) as u64
}

/// Length of a window in microseconds, saturating at `i64::MAX`.
pub(crate) fn window_micros(window_secs: u64) -> i64 {
    i64::try_from(window_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(MICROS_PER_SEC)
}

/// Outcome of one local window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after: u64,
}

/// Admission timestamps for one key, oldest first.
#[derive(Debug)]
struct WindowLog {
    hits: VecDeque<i64>,
    window_secs: u64,
}

impl WindowLog {
    fn new(window_secs: u64) -> Self {
        Self {
            hits: VecDeque::new(),
            window_secs,
        }
    }

    /// Drop every hit at or before `window_start`.
    fn evict(&mut self, window_start: i64) {
        while self.hits.front().is_some_and(|&t| t <= window_start) {
            self.hits.pop_front();
        }
    }

    /// True once the newest hit is older than the window plus grace.
    fn is_stale(&self, now: i64) -> bool {
        let horizon = window_micros(self.window_secs.saturating_add(GRACE_SECS));
        self.hits
            .back()
            .map_or(true, |&newest| newest.saturating_add(horizon) <= now)
    }
}

/// Sliding windows kept in this process, keyed by identity and bucket.
#[derive(Debug)]
pub struct LocalWindows {
    windows: DashMap<WindowKey, WindowLog>,
    calls: AtomicU64,
    sweep_every: u64,
}

impl LocalWindows {
    /// Create an empty set of windows that sweeps idle keys every
    /// `sweep_every` checks.
    pub fn new(sweep_every: u64) -> Self {
        Self {
            windows: DashMap::new(),
            calls: AtomicU64::new(0),
            sweep_every: sweep_every.max(1),
        }
    }

    /// Check and, if admitted, record one request at `now` (microseconds).
    pub fn hit(&self, key: &WindowKey, limit: u64, window_secs: u64, now: i64) -> Tally {
        let window_start = now.saturating_sub(window_micros(window_secs));

        let tally = {
            let mut log = self
                .windows
                .entry(key.clone())
                .or_insert_with(|| WindowLog::new(window_secs));
            log.window_secs = window_secs;
            log.evict(window_start);

            if log.hits.len() as u64 >= limit {
                let oldest = log.hits.front().copied().unwrap_or(now);
                Tally {
                    allowed: false,
                    remaining: 0,
                    reset_after: retry_after_secs(oldest, now, window_secs),
                }
            } else {
                log.hits.push_back(now);
                Tally {
                    allowed: true,
                    remaining: limit.saturating_sub(log.hits.len() as u64),
                    reset_after: window_secs,
                }
            }
        };

        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % self.sweep_every == 0 {
            self.sweep(now);
        }

        tally
    }

    /// Drop windows whose newest hit has already expired. Returns how many
    /// were removed.
    ///
    /// Safe to run alongside `hit`: a key removed here is recreated empty by
    /// the next check, which is what an expired window holds anyway.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, log| !log.is_stale(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "Swept idle local windows");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::sync::atomic::AtomicUsize;

    const SEC: i64 = MICROS_PER_SEC;

    fn key(id: &str) -> WindowKey {
        WindowKey::new(&Identity::user(id), "bucket")
    }

    #[test]
    fn test_retry_after_rounds_up_and_clamps() {
        // Oldest hit 10.5s ago in a 60s window: 49.5s left, reported as 50.
        assert_eq!(retry_after_secs(0, 10 * SEC + SEC / 2, 60), 50);
        // Exactly on the boundary still reports at least one second.
        assert_eq!(retry_after_secs(0, 60 * SEC, 60), 1);
        // Never more than the window.
        assert_eq!(retry_after_secs(100 * SEC, 0, 60), 60);
    }

    #[test]
    fn test_remaining_counts_down_then_denies() {
        let windows = LocalWindows::new(500);
        let k = key("1");

        let remaining: Vec<u64> = (0..5)
            .map(|_| {
                let tally = windows.hit(&k, 5, 60, 0);
                assert!(tally.allowed);
                assert_eq!(tally.reset_after, 60);
                tally.remaining
            })
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = windows.hit(&k, 5, 60, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, 60);
    }

    #[test]
    fn test_window_rolls_forward() {
        let windows = LocalWindows::new(500);
        let k = key("1");

        for i in 0..3 {
            assert!(windows.hit(&k, 3, 10, i * SEC).allowed);
        }
        let denied = windows.hit(&k, 3, 10, 5 * SEC);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, 5);

        // The first hit (t=0) leaves the window at t=10.
        assert!(windows.hit(&k, 3, 10, 10 * SEC).allowed);
        assert!(!windows.hit(&k, 3, 10, 10 * SEC).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let windows = LocalWindows::new(500);

        assert!(windows.hit(&key("a"), 1, 60, 0).allowed);
        assert!(!windows.hit(&key("a"), 1, 60, 0).allowed);
        assert!(windows.hit(&key("b"), 1, 60, 0).allowed);

        let other_bucket = WindowKey::new(&Identity::user("a"), "other");
        assert!(windows.hit(&other_bucket, 1, 60, 0).allowed);
    }

    #[test]
    fn test_sweep_drops_only_stale_keys() {
        let windows = LocalWindows::new(u64::MAX);

        windows.hit(&key("old"), 5, 10, 0);
        windows.hit(&key("fresh"), 5, 10, 9 * SEC);
        assert_eq!(windows.len(), 2);

        // "old" is stale once 10s window + 1s grace have passed.
        assert_eq!(windows.sweep(11 * SEC), 1);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows.sweep(11 * SEC), 0);
    }

    #[test]
    fn test_periodic_sweep_runs_on_cadence() {
        let windows = LocalWindows::new(3);

        windows.hit(&key("a"), 5, 1, 0);
        windows.hit(&key("b"), 5, 1, 0);
        assert_eq!(windows.len(), 2);

        // Third call triggers the sweep; a and b are long expired by then.
        windows.hit(&key("c"), 5, 1, 100 * SEC);
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_concurrent_hits_never_exceed_limit() {
        let windows = LocalWindows::new(500);
        let k = key("shared");
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if windows.hit(&k, 25, 60, 0).allowed {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 25);
    }
}
