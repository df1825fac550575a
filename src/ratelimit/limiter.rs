//! Core sliding-window-log limiter.

use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::key_state::{KeyState, RequestLog, TimerEntry};
use super::reaper::{self, ReaperHandle};
use super::window::{Window, WindowConfig};
use crate::error::Result;

/// Admission control over one or more rolling windows enforced together.
///
/// A request for a key is admitted only if every configured window still
/// has room, and an admission is recorded in every window at once.
/// Expired entries are evicted by per-(key, window) timers so that keys
/// which stop sending traffic are released.
///
/// All state sits behind one mutex, shared by admission checks and timer
/// firings. Construct one instance at startup and share it as `Arc<Limiter>`.
pub struct Limiter {
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
    /// Wakes the reaper when a timer earlier than its current deadline is armed
    wakeup: Arc<Notify>,
}

#[derive(Default)]
struct LimiterState {
    config: WindowConfig,
    keys: HashMap<Arc<str>, KeyState>,
    /// Every armed eviction timer, earliest first
    timers: BinaryHeap<Reverse<TimerEntry>>,
    admitted: u64,
    rejected: u64,
}

/// Point-in-time view of a limiter, for logs and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub windows: Vec<Window>,
    pub tracked_keys: usize,
    pub pending_timers: usize,
    pub logged_requests: usize,
    pub admitted: u64,
    pub rejected: u64,
}

impl Limiter {
    /// Create an unconfigured limiter reading the wall clock.
    ///
    /// Until windows are set, every request is admitted.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an unconfigured limiter reading the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(LimiterState::default()),
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Create a limiter with windows already in place.
    pub fn with_config(config: WindowConfig, clock: Arc<dyn Clock>) -> Self {
        let limiter = Self::with_clock(clock);
        limiter.set_config(config);
        limiter
    }

    /// Replace the windows from `(duration_secs, limit)` pairs.
    ///
    /// Invalid input is rejected before anything changes. On success all
    /// per-key history and pending timers are discarded.
    pub fn set_limits<I>(&self, windows: I) -> Result<()>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let config = WindowConfig::new(windows)?;
        self.set_config(config);
        Ok(())
    }

    /// Replace the windows with an already validated configuration.
    pub fn set_config(&self, config: WindowConfig) {
        let summary = config.to_string();
        let discarded_keys = {
            let mut state = self.state.lock();
            let discarded = state.keys.len();
            state.config = config;
            state.keys.clear();
            state.timers.clear();
            discarded
        };
        self.wakeup.notify_one();

        info!(
            windows = %summary,
            discarded_keys,
            "Rate limit windows configured"
        );
    }

    /// Admit a request for `key` if every window has room, recording it in all of them.
    ///
    /// Returns `false` without recording anything if any window is full.
    pub fn try_add_request_if_within_limits(&self, key: &str) -> bool {
        debug_assert!(!key.is_empty(), "rate limit key must not be empty");
        let now = self.clock.now_millis();

        let mut guard = self.state.lock();
        let LimiterState {
            config,
            keys,
            timers,
            admitted,
            rejected,
        } = &mut *guard;
        let windows = config.windows();

        trace!(key, now, "Checking rate limit");

        if windows.is_empty() {
            *admitted += 1;
            return true;
        }

        if let Some(key_state) = keys.get_mut(key) {
            key_state.assert_not_after(now);
            for (index, window) in windows.iter().enumerate() {
                if let Some(log) = key_state.log_mut(index) {
                    log.prune(window, now);
                }
            }

            let saturated = windows.iter().enumerate().find(|(index, window)| {
                let used = key_state.log(*index).map_or(0, RequestLog::len);
                used as u64 >= window.limit
            });
            if let Some((_, window)) = saturated {
                *rejected += 1;
                debug!(
                    key,
                    window_secs = window.duration_secs,
                    limit = window.limit,
                    "Rate limit exceeded"
                );
                return false;
            }
        }

        let shared_key: Arc<str> = match keys.get_key_value(key) {
            Some((existing, _)) => Arc::clone(existing),
            None => {
                debug!(key, "Tracking new rate limit key");
                Arc::from(key)
            }
        };
        let key_state = keys
            .entry(Arc::clone(&shared_key))
            .or_insert_with(|| KeyState::new(windows.len()));

        let head = timers.peek().map(|Reverse(entry)| entry.fire_at);
        let mut wake_reaper = false;
        for (index, window) in windows.iter().enumerate() {
            let log = key_state.log_or_default(index);
            log.record(now);
            if log.timer().is_none() {
                let fire_at = window.expiry(log.oldest().unwrap_or(now));
                log.set_timer(Some(fire_at));
                timers.push(Reverse(TimerEntry {
                    fire_at,
                    key: Arc::clone(&shared_key),
                    window: index,
                }));
                wake_reaper |= head.map_or(true, |head| fire_at < head);
            }
        }
        *admitted += 1;
        drop(guard);

        if wake_reaper {
            self.wakeup.notify_one();
        }
        true
    }

    /// Fire every eviction timer due at the current clock reading.
    ///
    /// Returns how many timers fired. The background reaper calls this; it
    /// can also be driven by hand together with a [`ManualClock`].
    ///
    /// [`ManualClock`]: super::ManualClock
    pub fn fire_due_timers(&self) -> usize {
        let now = self.clock.now_millis();

        let mut guard = self.state.lock();
        let LimiterState {
            config,
            keys,
            timers,
            ..
        } = &mut *guard;

        let mut fired = 0;
        while timers
            .peek()
            .is_some_and(|Reverse(entry)| entry.fire_at <= now)
        {
            let Some(Reverse(entry)) = timers.pop() else {
                break;
            };
            fire_timer(config, keys, timers, entry, now);
            fired += 1;
        }
        fired
    }

    /// Fire instant of the earliest pending eviction timer.
    pub fn next_deadline(&self) -> Option<u64> {
        let state = self.state.lock();
        state.timers.peek().map(|Reverse(entry)| entry.fire_at)
    }

    /// Run the eviction timers on a background tokio task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_reaper(self: &Arc<Self>) -> ReaperHandle {
        reaper::spawn(self)
    }

    /// Requests for `key` still counting against the window of `duration_secs`.
    ///
    /// Returns 0 for unknown keys and unconfigured durations.
    pub fn live_requests(&self, key: &str, duration_secs: u64) -> usize {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        let Some(index) = state.config.position(duration_secs) else {
            return 0;
        };
        let window = &state.config.windows()[index];
        state
            .keys
            .get(key)
            .and_then(|key_state| key_state.log(index))
            .map_or(0, |log| log.live_count(window, now))
    }

    /// Fire instant of the timer armed for (`key`, `duration_secs`), if any.
    pub fn pending_timer(&self, key: &str, duration_secs: u64) -> Option<u64> {
        let state = self.state.lock();
        let index = state.config.position(duration_secs)?;
        state
            .keys
            .get(key)
            .and_then(|key_state| key_state.log(index))
            .and_then(RequestLog::timer)
    }

    /// Number of keys currently holding any state.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Number of armed eviction timers across all keys and windows.
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// The active window configuration.
    pub fn windows(&self) -> WindowConfig {
        self.state.lock().config.clone()
    }

    /// Snapshot of the windows, tracked keys, pending timers and decision totals.
    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        let logged_requests = state
            .keys
            .values()
            .map(|key_state| {
                (0..state.config.len())
                    .filter_map(|index| key_state.log(index))
                    .map(RequestLog::len)
                    .sum::<usize>()
            })
            .sum();

        LimiterStats {
            windows: state.config.windows().to_vec(),
            tracked_keys: state.keys.len(),
            pending_timers: state.timers.len(),
            logged_requests,
            admitted: state.admitted,
            rejected: state.rejected,
        }
    }

    /// Forget all per-key history and pending timers, keeping the windows.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.keys.clear();
        state.timers.clear();
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        // Lets an idle reaper observe that the limiter is gone and exit.
        self.wakeup.notify_one();
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("clock", &self.clock)
            .field("windows", &self.windows().to_string())
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

/// Handle one popped timer: prune, then re-arm or release the (key, window).
fn fire_timer(
    config: &WindowConfig,
    keys: &mut HashMap<Arc<str>, KeyState>,
    timers: &mut BinaryHeap<Reverse<TimerEntry>>,
    entry: TimerEntry,
    now: u64,
) {
    let Some(window) = config.windows().get(entry.window) else {
        return;
    };
    let Some(key_state) = keys.get_mut(&entry.key) else {
        trace!(key = %entry.key, "Eviction timer fired for released key");
        return;
    };
    let Some(log) = key_state.log_mut(entry.window) else {
        return;
    };
    if log.timer() != Some(entry.fire_at) {
        trace!(key = %entry.key, fire_at = entry.fire_at, "Ignoring stale eviction timer");
        return;
    }

    let pruned = log.prune(window, now);
    match log.oldest() {
        Some(oldest) => {
            let fire_at = window.expiry(oldest);
            log.set_timer(Some(fire_at));
            trace!(
                key = %entry.key,
                window_secs = window.duration_secs,
                pruned,
                fire_at,
                "Eviction timer re-armed"
            );
            timers.push(Reverse(TimerEntry { fire_at, ..entry }));
        }
        None => {
            log.set_timer(None);
            key_state.release_if_idle(entry.window);
            trace!(
                key = %entry.key,
                window_secs = window.duration_secs,
                pruned,
                "Request log drained"
            );
            if key_state.is_vacant() {
                keys.remove(&entry.key);
                debug!(key = %entry.key, "Released idle rate limit key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use rand::Rng;

    const HOUR: u64 = 3600;
    const DAY: u64 = 86400;
    const T: u64 = 1_700_000_000_000;

    fn limiter_at(start: u64, windows: &[(u64, u64)]) -> (Limiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter = Limiter::with_clock(clock.clone());
        limiter.set_limits(windows.iter().copied()).unwrap();
        (limiter, clock)
    }

    /// Snapshot of (live entries, pending timer) per window for one key.
    fn snapshot(limiter: &Limiter, key: &str) -> Vec<(usize, Option<u64>)> {
        limiter
            .windows()
            .windows()
            .iter()
            .map(|w| {
                (
                    limiter.live_requests(key, w.duration_secs),
                    limiter.pending_timer(key, w.duration_secs),
                )
            })
            .collect()
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = Limiter::new();
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.pending_timers(), 0);
        assert!(limiter.windows().is_empty());
    }

    #[test]
    fn test_six_per_hour_then_rejects() {
        let (limiter, clock) = limiter_at(T, &[(HOUR, 6)]);

        for _ in 0..6 {
            assert!(limiter.try_add_request_if_within_limits("k"));
            clock.advance(10);
        }
        assert_eq!(clock.now_millis(), T + 60);
        assert!(!limiter.try_add_request_if_within_limits("k"));
        assert_eq!(limiter.live_requests("k", HOUR), 6);
    }

    #[test]
    fn test_timer_frees_exactly_one_slot() {
        let (limiter, clock) = limiter_at(T, &[(HOUR, 6)]);
        for _ in 0..6 {
            assert!(limiter.try_add_request_if_within_limits("k"));
            clock.advance(10);
        }
        assert!(!limiter.try_add_request_if_within_limits("k"));
        assert_eq!(limiter.pending_timer("k", HOUR), Some(T + 3_600_001));

        clock.set(T + 3_600_001);
        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.live_requests("k", HOUR), 5);
        assert_eq!(limiter.pending_timer("k", HOUR), Some(T + 10 + 3_600_001));

        assert!(limiter.try_add_request_if_within_limits("k"));
        clock.advance(1);
        assert!(!limiter.try_add_request_if_within_limits("k"));
        clock.advance(9);
        assert!(limiter.try_add_request_if_within_limits("k"));
    }

    #[test]
    fn test_no_windows_admits_everything() {
        let (limiter, _clock) = limiter_at(T, &[]);
        for _ in 0..10_000 {
            assert!(limiter.try_add_request_if_within_limits("k"));
        }
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.pending_timers(), 0);
        assert_eq!(limiter.stats().admitted, 10_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter_at(T, &[(60, 3)]);
        for _ in 0..3 {
            assert!(limiter.try_add_request_if_within_limits("a"));
        }
        assert!(!limiter.try_add_request_if_within_limits("a"));

        for _ in 0..3 {
            assert!(limiter.try_add_request_if_within_limits("b"));
        }
        assert!(!limiter.try_add_request_if_within_limits("b"));
        assert_eq!(limiter.live_requests("a", 60), 3);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_shorter_window_saturation_rejects_while_longer_has_room() {
        let (limiter, clock) = limiter_at(T, &[(HOUR, 6), (DAY, 20)]);
        for _ in 0..6 {
            assert!(limiter.try_add_request_if_within_limits("k"));
            clock.advance(1);
        }
        assert_eq!(limiter.live_requests("k", HOUR), 6);
        assert_eq!(limiter.live_requests("k", DAY), 6);
        assert!(!limiter.try_add_request_if_within_limits("k"));
        assert_eq!(limiter.live_requests("k", DAY), 6);
    }

    #[test]
    fn test_longer_window_saturation_outlives_shorter() {
        let (limiter, clock) = limiter_at(T, &[(HOUR, 6), (DAY, 20)]);
        let mut admitted = 0;
        // Four hours of saturated traffic fill the daily window.
        for _ in 0..4 {
            for _ in 0..6 {
                if limiter.try_add_request_if_within_limits("k") {
                    admitted += 1;
                }
            }
            clock.advance(HOUR * 1000 + 1);
            limiter.fire_due_timers();
        }
        assert_eq!(admitted, 20);
        assert_eq!(limiter.live_requests("k", HOUR), 0);
        assert_eq!(limiter.live_requests("k", DAY), 20);
        assert!(!limiter.try_add_request_if_within_limits("k"));
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let (limiter, clock) = limiter_at(T, &[(HOUR, 2), (DAY, 10)]);
        assert!(limiter.try_add_request_if_within_limits("k"));
        clock.advance(5);
        assert!(limiter.try_add_request_if_within_limits("k"));
        clock.advance(5);

        let before = snapshot(&limiter, "k");
        let timers_before = limiter.pending_timers();
        assert!(!limiter.try_add_request_if_within_limits("k"));
        assert_eq!(snapshot(&limiter, "k"), before);
        assert_eq!(limiter.pending_timers(), timers_before);
        assert_eq!(limiter.stats().rejected, 1);
    }

    #[test]
    fn test_one_timer_per_key_and_window() {
        let (limiter, clock) = limiter_at(T, &[(HOUR, 100), (DAY, 100)]);
        for _ in 0..50 {
            assert!(limiter.try_add_request_if_within_limits("k"));
            clock.advance(3);
        }
        assert_eq!(limiter.pending_timers(), 2);
        assert_eq!(limiter.pending_timer("k", HOUR), Some(T + 3_600_001));
        assert_eq!(limiter.pending_timer("k", DAY), Some(T + 86_400_001));
    }

    #[test]
    fn test_drained_key_is_released() {
        let (limiter, clock) = limiter_at(T, &[(60, 5)]);
        assert!(limiter.try_add_request_if_within_limits("k"));
        clock.advance(100);
        assert!(limiter.try_add_request_if_within_limits("k"));

        clock.set(T + 60_001);
        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.pending_timers(), 1);

        clock.set(T + 60_101);
        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.pending_timers(), 0);
        assert_eq!(limiter.next_deadline(), None);
    }

    #[test]
    fn test_late_timer_prunes_everything_expired() {
        let (limiter, clock) = limiter_at(T, &[(60, 5)]);
        for _ in 0..4 {
            assert!(limiter.try_add_request_if_within_limits("k"));
            clock.advance(10);
        }

        clock.set(T + 60_025);
        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.live_requests("k", 60), 1);
        assert_eq!(limiter.pending_timer("k", 60), Some(T + 30 + 60_001));
    }

    #[test]
    fn test_foreground_pruning_ahead_of_timer() {
        let (limiter, clock) = limiter_at(T, &[(60, 1)]);
        assert!(limiter.try_add_request_if_within_limits("k"));
        assert!(!limiter.try_add_request_if_within_limits("k"));

        // The check prunes the expired entry before the timer has fired.
        clock.set(T + 60_001);
        assert!(limiter.try_add_request_if_within_limits("k"));
        assert_eq!(limiter.pending_timer("k", 60), Some(T + 60_001));
        assert_eq!(limiter.pending_timers(), 1);

        // The old timer finds the new entry still live and re-arms for it.
        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.live_requests("k", 60), 1);
        assert_eq!(limiter.pending_timer("k", 60), Some(T + 60_001 + 60_001));
    }

    #[test]
    fn test_timer_on_log_drained_by_rejected_check() {
        let (limiter, clock) = limiter_at(T, &[(1, 5), (HOUR, 1)]);
        assert!(limiter.try_add_request_if_within_limits("k"));

        // The check empties the one-second log, then the hourly window rejects.
        clock.set(T + 1_001);
        assert!(!limiter.try_add_request_if_within_limits("k"));
        assert_eq!(limiter.live_requests("k", 1), 0);
        assert_eq!(limiter.pending_timer("k", 1), Some(T + 1_001));

        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.pending_timer("k", 1), None);
        assert_eq!(limiter.pending_timer("k", HOUR), Some(T + 3_600_001));
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.pending_timers(), 1);
    }

    #[test]
    fn test_clock_step_back_panics_before_recording() {
        let (limiter, clock) = limiter_at(1_000_000, &[(1, 5), (HOUR, 5)]);
        assert!(limiter.try_add_request_if_within_limits("k"));

        // The one-second slot drains and is released; the hourly log stays.
        clock.set(1_002_000);
        assert_eq!(limiter.fire_due_timers(), 1);
        assert_eq!(limiter.pending_timer("k", 1), None);

        clock.set(999_000);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            limiter.try_add_request_if_within_limits("k")
        }));
        assert!(result.is_err());

        assert_eq!(limiter.live_requests("k", 1), 0);
        assert_eq!(limiter.live_requests("k", HOUR), 1);
        assert_eq!(limiter.pending_timer("k", 1), None);
        assert_eq!(limiter.pending_timers(), 1);
        assert_eq!(limiter.stats().logged_requests, 1);
    }

    #[test]
    fn test_set_limits_discards_history() {
        let (limiter, _clock) = limiter_at(T, &[(60, 1)]);
        assert!(limiter.try_add_request_if_within_limits("k"));
        assert!(!limiter.try_add_request_if_within_limits("k"));

        limiter.set_limits([(60, 1), (HOUR, 5)]).unwrap();
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.pending_timers(), 0);
        assert!(limiter.try_add_request_if_within_limits("k"));
    }

    #[test]
    fn test_invalid_limits_keep_previous_config() {
        let (limiter, _clock) = limiter_at(T, &[(60, 1)]);
        assert!(limiter.try_add_request_if_within_limits("k"));

        assert!(limiter.set_limits([(60, 0)]).is_err());
        assert!(limiter.set_limits([(0, 3)]).is_err());
        assert_eq!(limiter.windows().to_string(), "1/60s");
        assert!(!limiter.try_add_request_if_within_limits("k"));
    }

    #[test]
    fn test_clear_counters() {
        let (limiter, _clock) = limiter_at(T, &[(60, 1)]);
        assert!(limiter.try_add_request_if_within_limits("k"));
        limiter.clear();
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.pending_timers(), 0);
        assert!(limiter.try_add_request_if_within_limits("k"));
    }

    #[test]
    fn test_stats_snapshot() {
        let (limiter, _clock) = limiter_at(T, &[(60, 2), (HOUR, 5)]);
        limiter.try_add_request_if_within_limits("a");
        limiter.try_add_request_if_within_limits("a");
        limiter.try_add_request_if_within_limits("a");
        limiter.try_add_request_if_within_limits("b");

        let stats = limiter.stats();
        assert_eq!(stats.tracked_keys, 2);
        assert_eq!(stats.pending_timers, 4);
        assert_eq!(stats.logged_requests, 6);
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.windows.len(), 2);
    }

    #[test]
    fn test_random_traffic_never_exceeds_limits() {
        let windows = [(1, 3), (10, 12), (60, 40)];
        let (limiter, clock) = limiter_at(T, &windows);
        let keys = ["alpha", "beta", "gamma", "delta"];
        let mut rng = rand::thread_rng();

        for _ in 0..5_000 {
            clock.advance(rng.gen_range(0..250));
            if rng.gen_bool(0.1) {
                limiter.fire_due_timers();
            }
            let key = keys[rng.gen_range(0..keys.len())];
            let before = snapshot(&limiter, key);
            let admitted = limiter.try_add_request_if_within_limits(key);

            for &(duration_secs, limit) in &windows {
                assert!(limiter.live_requests(key, duration_secs) as u64 <= limit);
            }
            if !admitted {
                assert_eq!(snapshot(&limiter, key), before);
            }
            assert!(limiter.pending_timers() <= keys.len() * windows.len());
        }
    }
}
