use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Request counters for a single remote domain
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainMetrics {
    /// Attempts started, including in-flight ones
    pub total_requests: u64,
    /// Attempts that completed successfully
    pub successful_requests: u64,
    /// Attempts that failed
    pub failed_requests: u64,
    /// Running average of successful response times, in milliseconds
    pub avg_response_time: f64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Time of the most recent failure
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl DomainMetrics {
    /// Fraction of attempts that failed
    pub fn failure_rate(&self) -> f64 {
        self.failed_requests as f64 / self.total_requests.max(1) as f64
    }

    /// Whether the last failure happened within `window` of `now`
    pub fn failed_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_failure_time
            .is_some_and(|at| now.signed_duration_since(at).to_std().unwrap_or_default() < window)
    }

    fn record_success(&mut self, elapsed: Duration) {
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        // Fixed 0.5 weight, so old samples decay slowly
        self.avg_response_time = (self.avg_response_time + elapsed.as_millis() as f64) / 2.0;
    }

    fn record_failure(&mut self, at: DateTime<Utc>) {
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.last_failure_time = Some(at);
    }
}

/// Totals across every tracked domain
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsTotals {
    /// Attempts started
    pub requests: u64,
    /// Successful attempts
    pub successes: u64,
    /// Failed attempts
    pub failures: u64,
}

impl MetricsTotals {
    /// Global success rate, 1.0 when nothing has been attempted
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }

    /// Global failure rate, 0.0 when nothing has been attempted
    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

/// In-memory metrics keyed by domain hostname
#[derive(Debug, Default)]
pub struct MetricsTracker {
    domains: HashMap<String, DomainMetrics>,
}

impl MetricsTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for a domain, if any attempt has been made against it
    pub fn get(&self, domain: &str) -> Option<&DomainMetrics> {
        self.domains.get(domain)
    }

    /// Count a new attempt, creating the domain entry on first use
    pub fn begin_attempt(&mut self, domain: &str) {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .total_requests += 1;
    }

    /// Record a completed successful attempt
    pub fn record_success(&mut self, domain: &str, elapsed: Duration) {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .record_success(elapsed);
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, domain: &str, at: DateTime<Utc>) {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .record_failure(at);
    }

    /// Sum of the counters across all domains
    pub fn totals(&self) -> MetricsTotals {
        self.domains
            .values()
            .fold(MetricsTotals::default(), |acc, m| MetricsTotals {
                requests: acc.requests + m.total_requests,
                successes: acc.successes + m.successful_requests,
                failures: acc.failures + m.failed_requests,
            })
    }

    /// Whether any domain failed within `window` of `now`
    pub fn any_failure_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.domains.values().any(|m| m.failed_within(now, window))
    }

    /// Sum of consecutive failures for domains that failed within `window` of `now`
    pub fn recent_failure_count(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        self.domains
            .values()
            .filter(|m| m.failed_within(now, window))
            .map(|m| m.consecutive_failures)
            .sum()
    }

    /// Mean of the per-domain average response times, in milliseconds
    pub fn average_response_time(&self) -> f64 {
        if self.domains.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.domains.values().map(|m| m.avg_response_time).sum();
        sum / self.domains.len() as f64
    }

    /// Point-in-time copy of every domain's metrics
    pub fn snapshot(&self) -> BTreeMap<String, DomainMetrics> {
        self.domains
            .iter()
            .map(|(domain, metrics)| (domain.clone(), metrics.clone()))
            .collect()
    }
}
