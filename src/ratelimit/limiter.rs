//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::window::SlidingWindow;
use crate::clock::Clock;
use crate::config::RateLimitingConfig;
use crate::error::{PacerError, Result};
use crate::store::{load_json, save_json, StateStore, RATE_LIMITER_KEY};

/// Limits and pacing applied to every send.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Maximum sends inside one sliding window
    pub hourly_cap: u32,
    /// Maximum sends per calendar day
    pub daily_cap: u32,
    /// Length of the sliding window
    pub window: Duration,
    /// Minimum spacing between two sends
    pub min_interval: Duration,
    /// Bounds of the random extra delay added before each send
    pub jitter: (Duration, Duration),
    /// Zone used to find midnight; local time when `None`
    pub reset_offset: Option<FixedOffset>,
}

impl RateLimitSettings {
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Ok(Self {
            hourly_cap: config.hourly_cap,
            daily_cap: config.daily_cap,
            window: config.window(),
            min_interval: config.min_interval(),
            jitter: (
                Duration::from_millis(config.jitter_min_ms),
                Duration::from_millis(config.jitter_max_ms),
            ),
            reset_offset: config.reset_offset()?,
        })
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            hourly_cap: 60,
            daily_cap: 1000,
            window: Duration::from_secs(3600),
            min_interval: Duration::from_secs(2),
            jitter: (Duration::ZERO, Duration::from_secs(1)),
            reset_offset: None,
        }
    }
}

/// Persisted limiter counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LimiterState {
    window: SlidingWindow,
    daily_count: u32,
    daily_reset_at: DateTime<Utc>,
}

impl LimiterState {
    fn fresh(now: DateTime<Utc>, offset: Option<FixedOffset>) -> Self {
        Self {
            window: SlidingWindow::new(),
            daily_count: 0,
            daily_reset_at: next_midnight(now, offset),
        }
    }

    /// Start a new day once the reset boundary has passed.
    fn roll_over(&mut self, now: DateTime<Utc>, offset: Option<FixedOffset>) -> bool {
        if now < self.daily_reset_at {
            return false;
        }
        debug!(
            previous_count = self.daily_count,
            reset_at = %self.daily_reset_at,
            "Daily limit window rolled over"
        );
        *self = Self::fresh(now, offset);
        true
    }
}

/// Snapshot of the limiter's budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStatus {
    pub sent_this_hour: u32,
    pub sent_today: u32,
    pub hourly_remaining: u32,
    pub daily_remaining: u32,
    pub next_reset_at: DateTime<Utc>,
}

/// Sliding-window and daily-cap limiter shared by the whole process.
///
/// Sends are serialized: concurrent [`await_slot`](Self::await_slot) callers
/// queue behind each other.
pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Mutex<LimiterState>,
    slot: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    persistence: Arc<dyn StateStore>,
}

impl RateLimiter {
    /// Build the limiter from persisted state, or start fresh.
    pub async fn load(
        settings: RateLimitSettings,
        clock: Arc<dyn Clock>,
        persistence: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let now = clock.now();
        let mut state = load_json::<LimiterState>(persistence.as_ref(), RATE_LIMITER_KEY)
            .await?
            .unwrap_or_else(|| LimiterState::fresh(now, settings.reset_offset));
        state.roll_over(now, settings.reset_offset);
        state.window.prune(now, settings.window);

        info!(
            sent_today = state.daily_count,
            sent_this_hour = state.window.len(),
            daily_cap = settings.daily_cap,
            hourly_cap = settings.hourly_cap,
            "Rate limiter initialized"
        );

        Ok(Self {
            settings,
            state: Mutex::new(state),
            slot: tokio::sync::Mutex::new(()),
            clock,
            persistence,
        })
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// True while today's count is below the daily cap.
    pub fn can_send_now(&self) -> bool {
        let mut state = self.state.lock();
        state.roll_over(self.clock.now(), self.settings.reset_offset);
        state.daily_count < self.settings.daily_cap
    }

    /// Wait until one more send is allowed, then record it.
    ///
    /// Fails with [`PacerError::RateLimitExceeded`] instead of waiting when
    /// the daily cap is already reached.
    pub async fn await_slot(&self) -> Result<()> {
        let _slot = self.slot.lock().await;
        let offset = self.settings.reset_offset;

        let hourly_wait = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            state.roll_over(now, offset);
            if state.daily_count >= self.settings.daily_cap {
                return Err(PacerError::RateLimitExceeded {
                    limit: self.settings.daily_cap,
                });
            }
            state.window.prune(now, self.settings.window);
            state
                .window
                .wait_for_room(now, self.settings.window, self.settings.hourly_cap)
        };

        if let Some(wait) = hourly_wait {
            info!(
                wait_secs = wait.as_secs(),
                hourly_cap = self.settings.hourly_cap,
                "Hourly limit reached, waiting for the window to open"
            );
            self.clock.sleep(wait).await;
            let now = self.clock.now();
            let mut state = self.state.lock();
            state.roll_over(now, offset);
            state.window.prune(now, self.settings.window);
        }

        let spacing = self
            .state
            .lock()
            .window
            .spacing_remaining(self.clock.now(), self.settings.min_interval);
        if let Some(wait) = spacing {
            trace!(wait_ms = wait.as_millis() as u64, "Enforcing minimum spacing");
            self.clock.sleep(wait).await;
        }

        let jitter = self.jitter();
        if !jitter.is_zero() {
            trace!(wait_ms = jitter.as_millis() as u64, "Applying pacing jitter");
            self.clock.sleep(jitter).await;
        }

        let snapshot = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            state.roll_over(now, offset);
            state.window.record(now);
            state.daily_count += 1;
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Current budget, after applying rollover and pruning.
    pub fn status(&self) -> LimiterStatus {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.roll_over(now, self.settings.reset_offset);
        state.window.prune(now, self.settings.window);

        let sent_this_hour = state.window.len() as u32;
        LimiterStatus {
            sent_this_hour,
            sent_today: state.daily_count,
            hourly_remaining: self.settings.hourly_cap.saturating_sub(sent_this_hour),
            daily_remaining: self.settings.daily_cap.saturating_sub(state.daily_count),
            next_reset_at: state.daily_reset_at,
        }
    }

    /// Forget all recorded sends.
    pub async fn reset(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            *state = LimiterState::fresh(self.clock.now(), self.settings.reset_offset);
            state.clone()
        };
        info!("Rate limiter reset");
        self.persist(&snapshot).await
    }

    fn jitter(&self) -> Duration {
        let (min, max) = self.settings.jitter;
        if max <= min {
            return min;
        }
        let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    async fn persist(&self, state: &LimiterState) -> Result<()> {
        save_json(self.persistence.as_ref(), RATE_LIMITER_KEY, state).await
    }
}

/// The first midnight strictly after `now`, in the given zone.
pub fn next_midnight(now: DateTime<Utc>, offset: Option<FixedOffset>) -> DateTime<Utc> {
    match offset {
        Some(offset) => midnight_after(now.with_timezone(&offset)),
        None => midnight_after(now.with_timezone(&Local)),
    }
}

fn midnight_after<Tz: TimeZone>(local: DateTime<Tz>) -> DateTime<Utc> {
    let tz = local.timezone();
    local
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| {
            // Midnight can fall in a DST gap in a few zones.
            tz.from_local_datetime(&midnight)
                .earliest()
                .or_else(|| {
                    tz.from_local_datetime(&(midnight + chrono::Duration::hours(1)))
                        .earliest()
                })
        })
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| local.with_timezone(&Utc) + chrono::Duration::days(1))
}
