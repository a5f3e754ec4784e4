//! Sliding window of recent send timestamps.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered timestamps of recent sends, oldest first.
///
/// After [`prune`](Self::prune) every entry lies strictly inside the
/// trailing window ending at `now`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlidingWindow {
    sends: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries at or before `now - length`.
    pub fn prune(&mut self, now: DateTime<Utc>, length: Duration) {
        let cutoff = now - to_chrono(length);
        while self.sends.front().is_some_and(|ts| *ts <= cutoff) {
            self.sends.pop_front();
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.sends.push_back(at);
    }

    pub fn clear(&mut self) {
        self.sends.clear();
    }

    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.sends.front().copied()
    }

    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.sends.back().copied()
    }

    /// How long until one more send fits under `cap`.
    ///
    /// `None` when there is room now. Call after `prune`.
    pub fn wait_for_room(&self, now: DateTime<Utc>, length: Duration, cap: u32) -> Option<Duration> {
        if self.sends.len() < cap as usize {
            return None;
        }
        let oldest = self.oldest()?;
        let elapsed = (now - oldest).to_std().unwrap_or(Duration::ZERO);
        let wait = length.saturating_sub(elapsed);
        (!wait.is_zero()).then_some(wait)
    }

    /// Remaining part of `min_interval` since the latest send.
    pub fn spacing_remaining(&self, now: DateTime<Utc>, min_interval: Duration) -> Option<Duration> {
        let latest = self.latest()?;
        let elapsed = (now - latest).to_std().unwrap_or(Duration::ZERO);
        let wait = min_interval.saturating_sub(elapsed);
        (!wait.is_zero()).then_some(wait)
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365_000))
}
