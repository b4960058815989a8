use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ApiError;

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 1_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 2_000;
// x1.5 per rate-limit response, kept in integer nanoseconds.
const ESCALATION_NUMERATOR: u128 = 3;
const ESCALATION_DENOMINATOR: u128 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub cooldown: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
        }
    }
}

impl BackoffPolicy {
    pub fn from_millis(initial_ms: u64, max_ms: u64, cooldown_ms: u64) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms.max(initial_ms)),
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    /// Delay after one more rate-limit response. Never shrinks and never
    /// exceeds the cap (unless `current` already does).
    pub fn next_delay(&self, current: Duration) -> Duration {
        let nanos = current.as_nanos() * ESCALATION_NUMERATOR / ESCALATION_DENOMINATOR;
        let escalated = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        escalated.min(self.max_delay).max(current)
    }
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        if !duration.is_zero() {
            sleep(duration);
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&mut self, _duration: Duration) {}
}

/// Process-wide pacing state shared by every destination write of a run.
/// The delay only grows; it is never reset within a run.
pub struct Pacer {
    policy: BackoffPolicy,
    delay: Duration,
    sleeper: Box<dyn Sleeper>,
    rate_limit_events: usize,
    retries: usize,
    slept: Duration,
}

impl Pacer {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_sleeper(policy, Box::new(ThreadSleeper))
    }

    /// Pacer that keeps all bookkeeping but never blocks.
    pub fn without_sleeping(policy: BackoffPolicy) -> Self {
        Self::with_sleeper(policy, Box::new(NoopSleeper))
    }

    pub fn with_sleeper(policy: BackoffPolicy, sleeper: Box<dyn Sleeper>) -> Self {
        Self {
            delay: policy.initial_delay,
            policy,
            sleeper,
            rate_limit_events: 0,
            retries: 0,
            slept: Duration::ZERO,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn rate_limit_events(&self) -> usize {
        self.rate_limit_events
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn total_slept(&self) -> Duration {
        self.slept
    }

    /// Record a rate-limit response and return the escalated delay.
    pub fn escalate(&mut self) -> Duration {
        self.rate_limit_events += 1;
        self.delay = self.policy.next_delay(self.delay);
        self.delay
    }

    /// Sleep the current delay, run `call`, and on a retryable failure cool
    /// down and run it exactly once more. A second failure is returned.
    pub fn paced<T, F>(&mut self, label: &str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Result<T, ApiError>,
    {
        self.pause(self.delay);
        match call() {
            Err(error) if error.is_rate_limited() || error.is_transient() => {
                self.cool_down(label, &error);
                call()
            }
            other => other,
        }
    }

    /// Same single-retry guard as [`Pacer::paced`] without the pacing sleep;
    /// used for reads.
    pub fn guarded<T, F>(&mut self, label: &str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Result<T, ApiError>,
    {
        match call() {
            Err(error) if error.is_rate_limited() || error.is_transient() => {
                self.cool_down(label, &error);
                call()
            }
            other => other,
        }
    }

    fn cool_down(&mut self, label: &str, error: &ApiError) {
        self.retries += 1;
        if error.is_rate_limited() {
            let delay = self.escalate();
            warn!(
                call = label,
                delay_ms = millis(delay),
                "rate limited, increasing delay"
            );
        } else {
            warn!(call = label, %error, "transient failure, retrying once");
        }
        let cooldown = match error {
            ApiError::RateLimited {
                retry_after_secs: Some(seconds),
            } => self.policy.cooldown.max(Duration::from_secs(*seconds)),
            _ => self.policy.cooldown,
        };
        self.pause(cooldown);
    }

    fn pause(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        debug!(sleep_ms = millis(duration), "pacing");
        self.slept += duration;
        self.sleeper.sleep(duration);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
