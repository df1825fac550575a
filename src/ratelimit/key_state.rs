//! Per-key bookkeeping: one request log per window and the timer guarding it.

use std::collections::VecDeque;
use std::sync::Arc;

use super::window::Window;

/// Timestamps of admitted requests for one (key, window), oldest first.
#[derive(Debug, Default)]
pub(crate) struct RequestLog {
    entries: VecDeque<u64>,
    /// Fire instant of the pending eviction timer, if one is armed
    timer: Option<u64>,
}

impl RequestLog {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn oldest(&self) -> Option<u64> {
        self.entries.front().copied()
    }

    pub(crate) fn timer(&self) -> Option<u64> {
        self.timer
    }

    pub(crate) fn set_timer(&mut self, fire_at: Option<u64>) {
        self.timer = fire_at;
    }

    /// Nothing logged and nothing scheduled: safe to discard.
    pub(crate) fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.timer.is_none()
    }

    /// Append an admission at `now`.
    ///
    /// # Panics
    ///
    /// Panics if `now` is earlier than the newest entry. Front-only pruning
    /// is only correct for a non-decreasing log.
    pub(crate) fn record(&mut self, now: u64) {
        if let Some(&newest) = self.entries.back() {
            assert!(
                now >= newest,
                "request log out of order: {} recorded after {}",
                now,
                newest
            );
        }
        self.entries.push_back(now);
    }

    pub(crate) fn newest(&self) -> Option<u64> {
        self.entries.back().copied()
    }

    /// Drop expired entries from the front. Returns how many were dropped.
    pub(crate) fn prune(&mut self, window: &Window, now: u64) -> usize {
        let mut pruned = 0;
        while let Some(&oldest) = self.entries.front() {
            if !window.is_expired(oldest, now) {
                break;
            }
            self.entries.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Entries still live at `now`, without mutating the log.
    pub(crate) fn live_count(&self, window: &Window, now: u64) -> usize {
        let expired = self
            .entries
            .partition_point(|&t| window.is_expired(t, now));
        self.entries.len() - expired
    }
}

/// State for one key: a slot per configured window, in configuration order.
///
/// An empty slot means that window has no log and no pending timer.
#[derive(Debug)]
pub(crate) struct KeyState {
    logs: Vec<Option<RequestLog>>,
}

impl KeyState {
    pub(crate) fn new(window_count: usize) -> Self {
        Self {
            logs: (0..window_count).map(|_| None).collect(),
        }
    }

    pub(crate) fn log(&self, window: usize) -> Option<&RequestLog> {
        self.logs.get(window).and_then(Option::as_ref)
    }

    pub(crate) fn log_mut(&mut self, window: usize) -> Option<&mut RequestLog> {
        self.logs.get_mut(window).and_then(Option::as_mut)
    }

    /// The log for `window`, created on first use.
    pub(crate) fn log_or_default(&mut self, window: usize) -> &mut RequestLog {
        self.logs[window].get_or_insert_with(RequestLog::default)
    }

    /// Discard the slot for `window` if it holds no entries and no timer.
    pub(crate) fn release_if_idle(&mut self, window: usize) {
        if let Some(slot) = self.logs.get_mut(window) {
            if slot.as_ref().is_some_and(RequestLog::is_idle) {
                *slot = None;
            }
        }
    }

    /// Fail fast if `now` is earlier than any logged request.
    ///
    /// Runs before an admission touches any log, so a clock that stepped
    /// backwards never leaves a request recorded in only some windows.
    ///
    /// # Panics
    ///
    /// Panics if some window already holds an entry newer than `now`.
    pub(crate) fn assert_not_after(&self, now: u64) {
        for log in self.logs.iter().flatten() {
            if let Some(newest) = log.newest() {
                assert!(
                    now >= newest,
                    "request log out of order: {} recorded after {}",
                    now,
                    newest
                );
            }
        }
    }

    /// No window holds any state for this key.
    pub(crate) fn is_vacant(&self) -> bool {
        self.logs.iter().all(Option::is_none)
    }
}

/// An armed eviction timer in the limiter's queue.
///
/// Ordered by fire instant first so a min-heap yields the earliest timer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerEntry {
    pub(crate) fire_at: u64,
    pub(crate) key: Arc<str>,
    pub(crate) window: usize,
}
