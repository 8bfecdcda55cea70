//! Adaptive pacing policy.
//!
//! Pure functions that turn domain metrics and the global delay multiplier
//! into concrete delays, plus the circuit breaker that guards the daily
//! batch. The scheduler owns all state; nothing here mutates it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::domain_metrics::{DomainMetrics, MetricsTracker};

/// Lower bound of the delay multiplier
pub const MIN_DELAY_MULTIPLIER: f64 = 0.8;
/// Upper bound of the delay multiplier
pub const MAX_DELAY_MULTIPLIER: f64 = 5.0;
/// Multiplier applied after resuming from an emergency stop
pub const RESUME_DELAY_MULTIPLIER: f64 = 2.0;
/// Factor applied to the multiplier after each success
const SUCCESS_RELAXATION: f64 = 0.95;

/// Backoff before retrying a failing domain, before exponent growth
const BACKOFF_BASE: Duration = Duration::from_secs(60);
/// Ceiling for the backoff delay
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
/// Exponent cap for the backoff curve
const BACKOFF_MAX_EXPONENT: u32 = 5;
/// Backoff used for domains with no metrics yet
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Base lookback before a property is due again
const BASE_LOOKBACK_HOURS: f64 = 48.0;

/// Requests needed before the breaker may trip
const BREAKER_MIN_REQUESTS: u64 = 10;
/// Failure rate above which the breaker may trip
const BREAKER_FAILURE_RATE: f64 = 0.5;
/// A failure must be this recent for the breaker to trip
const BREAKER_RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Global multiplier scaling every computed delay, kept within
/// [`MIN_DELAY_MULTIPLIER`, `MAX_DELAY_MULTIPLIER`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayMultiplier(f64);

impl Default for DelayMultiplier {
    fn default() -> Self {
        Self(1.0)
    }
}

impl DelayMultiplier {
    /// Create a multiplier, clamping into bounds
    pub fn new(value: f64) -> Self {
        Self(value.clamp(MIN_DELAY_MULTIPLIER, MAX_DELAY_MULTIPLIER))
    }

    /// Current value
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Ease off after a success
    pub fn relax(&mut self) {
        self.0 = (self.0 * SUCCESS_RELAXATION).max(MIN_DELAY_MULTIPLIER);
    }

    /// Slow down after a failure
    pub fn tighten(&mut self, factor: f64) {
        self.0 = (self.0 * factor).min(MAX_DELAY_MULTIPLIER);
    }

    /// Slow down hard after a rate-limit signal
    pub fn escalate(&mut self) {
        self.tighten(2.0);
    }

    /// Scale a duration by the multiplier
    pub fn scale(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.0)
    }
}

/// Delay between successful syncs of the same domain.
///
/// `base × (1 + failure_rate×2 + consecutive_failures×0.5) × multiplier`, or
/// `base` unscaled when the domain has no metrics yet.
pub fn domain_delay(
    base: Duration,
    metrics: Option<&DomainMetrics>,
    multiplier: DelayMultiplier,
) -> Duration {
    let Some(metrics) = metrics else {
        return base;
    };

    let factor =
        1.0 + metrics.failure_rate() * 2.0 + f64::from(metrics.consecutive_failures) * 0.5;
    multiplier.scale(base.mul_f64(factor))
}

/// Delay after a failed sync: `min(60s × factor^min(consecutive, 5), 30min)`,
/// or 5 minutes when the domain has no metrics yet
pub fn backoff_delay(metrics: Option<&DomainMetrics>, backoff_multiplier: f64) -> Duration {
    let Some(metrics) = metrics else {
        return DEFAULT_BACKOFF;
    };

    let exponent = metrics.consecutive_failures.min(BACKOFF_MAX_EXPONENT);
    let delay = BACKOFF_BASE.mul_f64(backoff_multiplier.powi(exponent as i32));
    delay.min(BACKOFF_CAP)
}

/// How long a property is left alone before it is due again. Grows by 10%
/// per failure seen across all domains, up to twice the 48 hour base.
pub fn adaptive_lookback(total_failures: u64) -> Duration {
    let factor = (1.0 + 0.1 * total_failures as f64).min(2.0);
    Duration::from_secs_f64(BASE_LOOKBACK_HOURS * factor * 3600.0)
}

/// Whether the circuit breaker refuses to start a batch.
///
/// Needs at least ten requests, a global failure rate above 50% and a
/// failure within the last five minutes.
pub fn circuit_breaker_tripped(
    enabled: bool,
    metrics: &MetricsTracker,
    now: DateTime<Utc>,
) -> bool {
    if !enabled {
        return false;
    }

    let totals = metrics.totals();
    if totals.requests < BREAKER_MIN_REQUESTS {
        return false;
    }

    totals.failure_rate() > BREAKER_FAILURE_RATE
        && metrics.any_failure_within(now, BREAKER_RECENT_WINDOW)
}

/// Randomized delay before the daily batch, 0 to 1 hour scaled by the multiplier
pub fn randomized_start_delay(multiplier: DelayMultiplier) -> Duration {
    let secs = rand::rng().random_range(0.0..3600.0);
    multiplier.scale(Duration::from_secs_f64(secs))
}

/// Randomized pause between two domains, 15 to 45 seconds
pub fn inter_domain_delay() -> Duration {
    Duration::from_millis(rand::rng().random_range(15_000..=45_000))
}
