//! Backoff state machines for connect retries and reconnect pacing.

use std::time::Duration;

use tokio::time::Instant;

/// Default initial connect backoff.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default connect backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential backoff for consecutive connect failures.
///
/// The n-th consecutive failure waits `min(initial * 2^n, max)`. With a
/// `limit`, the failure that brings the count to the limit exhausts the
/// backoff instead.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    limit: Option<u32>,
    retry_count: u32,
}

impl Backoff {
    /// `limit = None` retries forever.
    pub fn new(initial: Duration, max: Duration, limit: Option<u32>) -> Self {
        Self {
            initial,
            max,
            limit,
            retry_count: 0,
        }
    }

    /// Records a failure. Returns the delay before the next attempt, or
    /// `None` once the retry limit is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.retry_count = self.retry_count.saturating_add(1);

        if let Some(limit) = self.limit {
            if self.retry_count >= limit {
                return None;
            }
        }

        Some(self.delay_for(self.retry_count))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF, None)
    }
}

/// Paces reconnects so a flapping link does not hammer the venue.
///
/// A reconnect waits out whatever is left of the current delay since the last
/// successful connect. Each reconnect then either resets the delay, when the
/// previous reconnect was long enough ago, or doubles it up to `max`.
#[derive(Debug, Clone)]
pub struct ReconnectPacer {
    initial: Duration,
    max: Duration,
    delay: Duration,
    last_connect: Option<Instant>,
    last_reconnect: Option<Instant>,
}

impl ReconnectPacer {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            delay: initial,
            last_connect: None,
            last_reconnect: None,
        }
    }

    /// Returns how long to wait before reconnecting at `now` and advances the
    /// delay for the next reconnect.
    pub fn plan(&mut self, now: Instant) -> Duration {
        let wait = match self.last_connect {
            Some(connected) => self.delay.saturating_sub(now.saturating_duration_since(connected)),
            None => Duration::ZERO,
        };

        let healthy = match self.last_reconnect {
            Some(previous) => now.saturating_duration_since(previous) > self.delay * 2,
            None => true,
        };

        self.delay = if healthy {
            self.initial
        } else {
            (self.delay * 2).min(self.max)
        };
        self.last_reconnect = Some(now);

        wait
    }

    /// Records a successful connect.
    pub fn connected(&mut self, now: Instant) {
        self.last_connect = Some(now);
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn last_connect(&self) -> Option<Instant> {
        self.last_connect
    }
}
