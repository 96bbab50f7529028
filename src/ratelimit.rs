//! Request budgeting shared by every fetch task of one source.
//!
//! A [`RateLimiter`] combines up to three constraints, all checked inside one
//! critical section:
//!
//! - a local ceiling: either a sliding window (`ceiling` requests per `window`) or a
//!   token bucket for sources without a quota signal,
//! - the remote quota last reported through [`RateLimiter::observe`],
//! - a cooldown entered after the remote side refused a request.
//!
//! [`RateLimiter::acquire`] never fails; it suspends until every constraint allows the
//! request and then debits the budget.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Wait applied when a quota-exhaustion signal carries no reset time.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Upper bound on any single cooldown, whatever the remote side reports.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
enum Mode {
    Window { ceiling: u32, window: Duration },
    TokenBucket { per_second: f64, burst: f64 },
}

#[derive(Debug, Clone, Copy)]
struct RemoteQuota {
    remaining: u64,
    reset_at: Instant,
}

#[derive(Debug)]
struct LimiterState {
    issued: VecDeque<Instant>,
    tokens: f64,
    last_refill: Instant,
    remote: Option<RemoteQuota>,
    cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    mode: Mode,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// At most `ceiling` requests within any rolling `window`.
    pub fn windowed(name: impl Into<String>, ceiling: u32, window: Duration) -> Self {
        Self::with_mode(
            name,
            Mode::Window {
                ceiling: ceiling.max(1),
                window,
            },
        )
    }

    /// Steady `per_minute` request rate with bursts up to `burst` requests.
    pub fn token_bucket(name: impl Into<String>, per_minute: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self::with_mode(
            name,
            Mode::TokenBucket {
                per_second: f64::from(per_minute.max(1)) / 60.0,
                burst,
            },
        )
    }

    fn with_mode(name: impl Into<String>, mode: Mode) -> Self {
        let tokens = match mode {
            Mode::TokenBucket { burst, .. } => burst,
            Mode::Window { .. } => 0.0,
        };
        Self {
            name: name.into(),
            mode,
            state: Mutex::new(LimiterState {
                issued: VecDeque::new(),
                tokens,
                last_refill: Instant::now(),
                remote: None,
                cooldown_until: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Suspend until `cost` requests may be issued, then debit them.
    pub async fn acquire(&self, cost: u32) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                match state.try_debit(Instant::now(), cost, self.mode) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "waiting for request budget");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record the remote quota reported alongside a response.
    pub async fn observe(&self, remaining: u64, reset_at: DateTime<Utc>) {
        let reset_at = instant_for(reset_at);
        let mut state = self.state.lock().await;
        state.remote = match state.remote {
            // Responses to concurrent requests can arrive out of order; within one
            // quota window the lowest count is the freshest.
            Some(current) if same_reset(current.reset_at, reset_at) => Some(RemoteQuota {
                remaining: remaining.min(current.remaining),
                reset_at,
            }),
            _ => Some(RemoteQuota { remaining, reset_at }),
        };
    }

    /// Enter cooldown after a quota-exhaustion signal. The longest pending cooldown wins.
    ///
    /// Returns how long callers will be held back.
    pub async fn cooldown(&self, reset_at: Option<DateTime<Utc>>) -> Duration {
        let wait = cooldown_wait(reset_at);
        let until = Instant::now() + wait;
        let mut state = self.state.lock().await;
        match state.cooldown_until {
            Some(existing) if existing >= until => existing.saturating_duration_since(Instant::now()),
            _ => {
                info!(limiter = %self.name, wait_secs = wait.as_secs(), "quota exhausted, cooling down");
                state.cooldown_until = Some(until);
                wait
            }
        }
    }

    pub async fn is_cooling_down(&self) -> bool {
        let state = self.state.lock().await;
        state.cooldown_until.is_some_and(|until| until > Instant::now())
    }
}

impl LimiterState {
    /// Debit `cost` if every constraint allows it, otherwise report how long to wait.
    fn try_debit(&mut self, now: Instant, cost: u32, mode: Mode) -> Result<(), Duration> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(until - now);
            }
            self.cooldown_until = None;
        }

        if let Some(remote) = self.remote {
            if now >= remote.reset_at {
                self.remote = None;
            } else if remote.remaining < u64::from(cost) {
                return Err(remote.reset_at - now);
            }
        }

        match mode {
            Mode::Window { ceiling, window } => {
                let cost = cost.min(ceiling) as usize;
                while self.issued.front().is_some_and(|&at| at + window <= now) {
                    self.issued.pop_front();
                }
                if self.issued.len() + cost > ceiling as usize {
                    // The oldest entries have to age out before `cost` more fit.
                    let blocking = self.issued.len() + cost - ceiling as usize;
                    let expires = self.issued[blocking - 1] + window;
                    return Err(expires.saturating_duration_since(now).max(Duration::from_millis(1)));
                }
                self.issued.extend(std::iter::repeat(now).take(cost));
            }
            Mode::TokenBucket { per_second, burst } => {
                let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
                self.tokens = (self.tokens + elapsed * per_second).min(burst);
                self.last_refill = now;
                let needed = f64::from(cost).min(burst);
                if self.tokens < needed {
                    let secs = (needed - self.tokens) / per_second;
                    return Err(Duration::from_secs_f64(secs).max(Duration::from_millis(1)));
                }
                self.tokens -= needed;
            }
        }

        if let Some(remote) = self.remote.as_mut() {
            remote.remaining = remote.remaining.saturating_sub(u64::from(cost));
        }
        Ok(())
    }
}

/// How long to hold back after a rate-limit signal with the given reset time.
pub fn cooldown_wait(reset_at: Option<DateTime<Utc>>) -> Duration {
    match reset_at {
        Some(reset_at) => (reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_COOLDOWN),
        None => DEFAULT_COOLDOWN,
    }
}

/// Reset instant for a `Retry-After` of `secs`, capped at [`MAX_COOLDOWN`] from now.
pub fn reset_after(secs: u64) -> Option<DateTime<Utc>> {
    let secs = secs.min(MAX_COOLDOWN.as_secs());
    TimeDelta::try_seconds(i64::try_from(secs).ok()?).and_then(|delta| Utc::now().checked_add_signed(delta))
}

/// Reset times are reported with one-second resolution.
fn same_reset(a: Instant, b: Instant) -> bool {
    a.max(b) - a.min(b) < Duration::from_secs(1)
}

fn instant_for(at: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    match (at - Utc::now()).to_std() {
        Ok(ahead) => now + ahead.min(MAX_COOLDOWN),
        Err(_) => now,
    }
}
