//! Sliding-window rate limiter with global and per-key budgets.
//!
//! Admission keeps two timestamp series: one global, one per key. An event is
//! admitted only when both series have room inside the window; admission
//! appends the current instant to both. Entries older than `now - window`
//! are evicted with a strict `<` comparison, so a timestamp landing exactly
//! on the window edge is dropped.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default sliding window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    window: Duration,
    /// Max admitted events in the window across all keys.
    global_limit: usize,
    /// Max admitted events in the window for one key, absent an override.
    per_key_limit: usize,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    global: VecDeque<Instant>,
    per_key: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(global_limit: usize, per_key_limit: usize) -> Self {
        Self::with_window(global_limit, per_key_limit, DEFAULT_WINDOW)
    }

    /// Window-parameterised constructor, used by tests to avoid minute-long sleeps.
    pub fn with_window(global_limit: usize, per_key_limit: usize, window: Duration) -> Self {
        Self {
            window,
            global_limit,
            per_key_limit,
            state: Mutex::new(State::default()),
        }
    }

    /// Admission check for one event under `key`.
    ///
    /// `limit_override`: 0 admits unconditionally (bypasses both budgets);
    /// a positive value replaces the per-key limit for this key.
    pub fn allow(&self, key: &str, limit_override: Option<u32>) -> bool {
        self.allow_at(key, limit_override, Instant::now())
    }

    fn allow_at(&self, key: &str, limit_override: Option<u32>, now: Instant) -> bool {
        if limit_override == Some(0) {
            return true;
        }

        let mut state = self.state.lock();
        let cutoff = now.checked_sub(self.window);

        prune(&mut state.global, cutoff);
        if state.global.len() >= self.global_limit {
            return false;
        }

        let limit = match limit_override {
            Some(n) => n as usize,
            None => self.per_key_limit,
        };
        let series = state.per_key.entry(key.to_string()).or_default();
        prune(series, cutoff);
        if series.len() >= limit {
            return false;
        }

        series.push_back(now);
        state.global.push_back(now);
        true
    }

    /// Drop keys whose series have fully expired. Called opportunistically by
    /// the engine's maintenance tick to stop idle keys accumulating.
    pub fn compact(&self) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window);
        let mut state = self.state.lock();
        prune(&mut state.global, cutoff);
        state.per_key.retain(|_, series| {
            prune(series, cutoff);
            !series.is_empty()
        });
    }
}

/// Retain only timestamps strictly newer than the cutoff.
fn prune(series: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else { return };
    while let Some(front) = series.front() {
        if *front < cutoff {
            series.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_key_budget_enforced() {
        let rl = RateLimiter::new(100, 3);
        assert!(rl.allow("a", None));
        assert!(rl.allow("a", None));
        assert!(rl.allow("a", None));
        assert!(!rl.allow("a", None));
        // Independent key has its own budget
        assert!(rl.allow("b", None));
    }

    #[test]
    fn global_budget_enforced_across_keys() {
        let rl = RateLimiter::new(4, 100);
        assert!(rl.allow("a", None));
        assert!(rl.allow("b", None));
        assert!(rl.allow("c", None));
        assert!(rl.allow("d", None));
        assert!(!rl.allow("e", None));
    }

    #[test]
    fn zero_override_bypasses_everything() {
        let rl = RateLimiter::new(1, 1);
        assert!(rl.allow("a", None));
        assert!(!rl.allow("a", None));
        // override 0 admits even with both budgets exhausted
        assert!(rl.allow("a", Some(0)));
        assert!(rl.allow("b", Some(0)));
    }

    #[test]
    fn positive_override_replaces_per_key_limit() {
        let rl = RateLimiter::new(100, 1);
        assert!(rl.allow("a", Some(3)));
        assert!(rl.allow("a", Some(3)));
        assert!(rl.allow("a", Some(3)));
        assert!(!rl.allow("a", Some(3)));
    }

    #[test]
    fn window_expiry_readmits() {
        let rl = RateLimiter::with_window(100, 1, Duration::from_millis(50));
        assert!(rl.allow("a", None));
        assert!(!rl.allow("a", None));
        std::thread::sleep(Duration::from_millis(80));
        assert!(rl.allow("a", None));
    }

    #[test]
    fn compact_drops_expired_keys() {
        let rl = RateLimiter::with_window(100, 5, Duration::from_millis(10));
        assert!(rl.allow("a", None));
        std::thread::sleep(Duration::from_millis(30));
        rl.compact();
        assert!(rl.state.lock().per_key.is_empty());
    }

    #[test]
    fn denied_events_consume_no_budget() {
        let rl = RateLimiter::new(2, 1);
        assert!(rl.allow("a", None));
        assert!(!rl.allow("a", None)); // denied per-key
        // the denial above must not have burned the second global slot
        assert!(rl.allow("b", None));
    }
}
