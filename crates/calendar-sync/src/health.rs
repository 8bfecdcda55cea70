use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::error;

use crate::domain_metrics::DomainMetrics;
use crate::property_store::PropertyFilter;
use crate::scheduler::SyncScheduler;
use crate::sync_types::StoreError;

/// Window for counting recent failures
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Success rate the system must stay above to be healthy
const HEALTHY_SUCCESS_RATE: f64 = 0.8;
/// Recent failures at or above this count make the system unhealthy
const MAX_RECENT_FAILURES: u32 = 5;
/// Configured minimum delays below this are flagged
const LOW_MIN_DELAY: Duration = Duration::from_secs(5);
/// Delay multipliers above this are flagged
const HIGH_DELAY_MULTIPLIER: f64 = 2.0;
/// Average response times above this are flagged, in milliseconds
const SLOW_RESPONSE_MS: f64 = 30_000.0;

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether a batch is running
    pub is_sync_running: bool,
    /// Whether the emergency stop is active
    pub is_emergency_stop_active: bool,
    /// Property syncs in flight
    pub current_sync_count: usize,
    /// Configured in-flight ceiling
    pub max_concurrent_syncs: usize,
    /// Global delay multiplier
    pub dynamic_delay_multiplier: f64,
    /// Duration of the last batch, in milliseconds
    pub last_sync_duration_ms: Option<u64>,
    /// Metrics per domain
    pub domain_metrics: BTreeMap<String, DomainMetrics>,
}

/// Scraping health diagnostic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall verdict
    pub healthy: bool,
    /// Active properties with a public URL
    pub active_properties: i64,
    /// Global success rate, 1.0 with no data
    pub success_rate: f64,
    /// Mean response time across domains, in milliseconds
    pub average_response_time: f64,
    /// Consecutive failures on domains that failed in the last hour
    pub recent_failures: u32,
    /// Suggested operator actions
    pub recommendations: Vec<String>,
}

impl HealthReport {
    fn unstable() -> Self {
        Self {
            healthy: false,
            active_properties: 0,
            success_rate: 0.0,
            average_response_time: 0.0,
            recent_failures: 0,
            recommendations: vec![
                "Health check failed, calendar sync is potentially unstable".to_string(),
            ],
        }
    }
}

impl SyncScheduler {
    /// Snapshot of the scheduler flags, counters and domain metrics
    pub async fn get_sync_status(&self) -> SyncStatus {
        SyncStatus {
            is_sync_running: self.is_sync_running(),
            is_emergency_stop_active: self.is_emergency_stop_active(),
            current_sync_count: self.current_sync_count(),
            max_concurrent_syncs: self.config().max_concurrent_syncs,
            dynamic_delay_multiplier: self.delay_multiplier().await,
            last_sync_duration_ms: self
                .last_sync_duration()
                .await
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            domain_metrics: self.metrics.read().await.snapshot(),
        }
    }

    /// Diagnose scraping health and suggest adjustments. Never fails.
    pub async fn check_scraping_health(&self) -> HealthReport {
        match self.build_health_report().await {
            Ok(report) => report,
            Err(e) => {
                error!("Scraping health check failed: {}", e);
                HealthReport::unstable()
            }
        }
    }

    async fn build_health_report(&self) -> Result<HealthReport, StoreError> {
        let active_properties = self
            .store()
            .count_matching(&PropertyFilter::eligible())
            .await?;

        let now = self.clock().now();
        let (totals, average_response_time, recent_failures) = {
            let metrics = self.metrics.read().await;
            (
                metrics.totals(),
                metrics.average_response_time(),
                metrics.recent_failure_count(now, RECENT_FAILURE_WINDOW),
            )
        };
        let success_rate = totals.success_rate();
        let multiplier = self.delay_multiplier().await;
        let config = self.config();

        let mut recommendations = Vec::new();
        if active_properties == 0 {
            recommendations.push("No active properties with a public URL to sync".to_string());
        }
        if !config.respectful_sync_enabled {
            recommendations
                .push("Enable respectful sync mode to avoid overloading listing sites".to_string());
        }
        if config.min_delay_between_syncs() < LOW_MIN_DELAY {
            recommendations.push(format!(
                "Minimum delay between syncs is {}ms, consider at least {}ms",
                config.min_delay_between_syncs_ms,
                LOW_MIN_DELAY.as_millis()
            ));
        }
        if success_rate < HEALTHY_SUCCESS_RATE {
            recommendations.push(format!(
                "Success rate is {:.1}%, check for blocking or layout changes",
                success_rate * 100.0
            ));
        }
        if multiplier > HIGH_DELAY_MULTIPLIER {
            recommendations.push(format!(
                "Delay multiplier is elevated at {:.2}x, listing sites may be pushing back",
                multiplier
            ));
        }
        if self.is_circuit_breaker_tripped().await {
            recommendations
                .push("Circuit breaker is open, scheduled syncs are paused".to_string());
        }
        if average_response_time > SLOW_RESPONSE_MS {
            recommendations.push(format!(
                "Average response time is {:.0}ms, the extraction service may be struggling",
                average_response_time
            ));
        }

        let healthy = success_rate > HEALTHY_SUCCESS_RATE
            && !self.is_emergency_stop_active()
            && recent_failures < MAX_RECENT_FAILURES;

        Ok(HealthReport {
            healthy,
            active_properties,
            success_rate,
            average_response_time,
            recent_failures,
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::SyncConfig;
    use crate::test_support::*;

    #[tokio::test]
    async fn test_status_reflects_scheduler_state() {
        let harness = Harness::new(SyncConfig::default());
        let property = property_at("https://www.airbnb.com/rooms/1");
        let _ = harness.scheduler.sync_property_with_metrics(&property).await;

        let status = harness.scheduler.get_sync_status().await;
        assert!(!status.is_sync_running);
        assert!(!status.is_emergency_stop_active);
        assert_eq!(status.current_sync_count, 0);
        assert_eq!(status.max_concurrent_syncs, 2);
        assert!(status.last_sync_duration_ms.is_none());
        assert_eq!(status.domain_metrics["www.airbnb.com"].total_requests, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["dynamicDelayMultiplier"], 0.95);
        assert_eq!(json["domainMetrics"]["www.airbnb.com"]["successfulRequests"], 1);
    }

    #[tokio::test]
    async fn test_healthy_with_no_data() {
        let harness = Harness::new(SyncConfig::default());
        harness.store.insert(property_at("https://www.airbnb.com/rooms/1"));

        let report = harness.scheduler.check_scraping_health().await;
        assert!(report.healthy);
        assert_eq!(report.active_properties, 1);
        assert_eq!(report.success_rate, 1.0);
        assert!(report.recommendations.is_empty(), "{:?}", report.recommendations);
    }

    #[tokio::test]
    async fn test_recommendations_follow_thresholds() {
        let harness = Harness::new(SyncConfig {
            respectful_sync_enabled: false,
            min_delay_between_syncs_ms: 1_000,
            ..Default::default()
        });
        {
            let now = harness.clock.now();
            let mut metrics = harness.scheduler.metrics.write().await;
            for _ in 0..10 {
                metrics.begin_attempt("www.vrbo.com");
                metrics.record_failure("www.vrbo.com", now);
            }
            metrics.begin_attempt("www.airbnb.com");
            metrics.record_success("www.airbnb.com", Duration::from_secs(150));
        }
        harness
            .scheduler
            .handle_sync_error(&crate::SyncError::Extraction(
                crate::ExtractionError::from_message("429"),
            ))
            .await;
        harness
            .scheduler
            .handle_sync_error(&crate::SyncError::Extraction(
                crate::ExtractionError::from_message("429"),
            ))
            .await;

        let report = harness.scheduler.check_scraping_health().await;
        assert!(!report.healthy);
        assert_eq!(report.recent_failures, 10);
        assert_eq!(report.active_properties, 0);
        // One per threshold: no properties, respectful mode, low delay,
        // success rate, multiplier, breaker, response time
        assert_eq!(report.recommendations.len(), 7, "{:?}", report.recommendations);
    }

    #[tokio::test]
    async fn test_emergency_stop_is_unhealthy() {
        let harness = Harness::new(SyncConfig::default());
        harness.store.insert(property_at("https://www.airbnb.com/rooms/1"));
        harness.scheduler.emergency_stop(None).await;

        let report = harness.scheduler.check_scraping_health().await;
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn test_store_failure_reports_unstable() {
        let harness = Harness::new(SyncConfig::default());
        harness.store.fail_queries();

        let report = harness.scheduler.check_scraping_health().await;
        assert!(!report.healthy);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("potentially unstable"));
    }
}
