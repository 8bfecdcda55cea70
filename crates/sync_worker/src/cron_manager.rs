use std::sync::Arc;

use anyhow::Context;
use calendar_sync::{BatchOutcome, SyncScheduler};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

/// Cron expression for the hourly health report
const HEALTH_REPORT_CRON: &str = "0 30 * * * *";

/// Owns the cron jobs that fire the scheduler's batch triggers
pub struct CronTriggers {
    scheduler: Arc<SyncScheduler>,
    jobs: Option<JobScheduler>,
}

impl CronTriggers {
    /// Create triggers for the given scheduler
    pub fn new(scheduler: Arc<SyncScheduler>) -> Self {
        Self {
            scheduler,
            jobs: None,
        }
    }

    /// Register the daily, priority and health report jobs and start them
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running() {
            warn!("Sync triggers already running");
            return Ok(());
        }

        let config = self.scheduler.config();
        let jobs = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;

        let scheduler = self.scheduler.clone();
        let daily = Job::new_async(config.daily_sync_cron.as_str(), move |_id, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                log_outcome("Daily", scheduler.run_daily_sync().await);
            })
        })
        .with_context(|| format!("Invalid daily sync cron {:?}", config.daily_sync_cron))?;

        let scheduler = self.scheduler.clone();
        let priority = Job::new_async(config.priority_sync_cron.as_str(), move |_id, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                log_outcome("Priority", scheduler.run_priority_sync().await);
            })
        })
        .with_context(|| format!("Invalid priority sync cron {:?}", config.priority_sync_cron))?;

        let scheduler = self.scheduler.clone();
        let health = Job::new_async(HEALTH_REPORT_CRON, move |_id, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                report_health(&scheduler).await;
            })
        })
        .context("Invalid health report cron")?;

        for job in [daily, priority, health] {
            let job_id = jobs.add(job).await.context("Failed to register sync job")?;
            debug!("Registered sync job {}", job_id);
        }

        jobs.start().await.context("Failed to start job scheduler")?;
        self.jobs = Some(jobs);

        info!(
            "Sync triggers started (daily: {}, priority: {})",
            config.daily_sync_cron, config.priority_sync_cron
        );
        Ok(())
    }

    /// Stop firing new batches. A batch already running is left to finish.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(mut jobs) = self.jobs.take() {
            info!("Stopping sync triggers");
            jobs.shutdown()
                .await
                .context("Failed to shut down job scheduler")?;
        }
        Ok(())
    }

    /// Whether the cron jobs are registered and running
    pub fn is_running(&self) -> bool {
        self.jobs.is_some()
    }
}

fn log_outcome(label: &str, outcome: BatchOutcome) {
    match outcome {
        BatchOutcome::Skipped(reason) => debug!("{} sync skipped: {:?}", label, reason),
        BatchOutcome::Completed(summary) if summary.stopped_early => warn!(
            "{} sync stopped early: {} of {} properties synced",
            label, summary.succeeded, summary.selected
        ),
        BatchOutcome::Completed(summary) => info!(
            "{} sync completed: {} succeeded, {} failed",
            label, summary.succeeded, summary.failed
        ),
        BatchOutcome::Failed(e) => error!("{} sync failed: {}", label, e),
    }
}

/// Log the scheduler status and any health recommendations
pub async fn report_health(scheduler: &SyncScheduler) {
    let status = scheduler.get_sync_status().await;
    debug!(
        "Sync status: running={}, emergency_stop={}, in_flight={}/{}, multiplier={:.2}",
        status.is_sync_running,
        status.is_emergency_stop_active,
        status.current_sync_count,
        status.max_concurrent_syncs,
        status.dynamic_delay_multiplier
    );

    let report = scheduler.check_scraping_health().await;
    if report.healthy {
        info!(
            "Calendar sync healthy: {} properties, {:.1}% success",
            report.active_properties,
            report.success_rate * 100.0
        );
    } else {
        warn!(
            "Calendar sync unhealthy: {:.1}% success, {} recent failures",
            report.success_rate * 100.0,
            report.recent_failures
        );
    }

    for recommendation in &report.recommendations {
        warn!("Sync recommendation: {}", recommendation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use calendar_sync::{
        PropertyFilter, PropertySort, PropertyStore, RemoteExtractionClient, StoreError,
        SyncConfig, SyncWriteback, SystemClock,
    };
    use uuid::Uuid;

    struct EmptyStore;

    #[async_trait::async_trait]
    impl PropertyStore for EmptyStore {
        async fn find_due_properties(
            &self,
            _filter: &PropertyFilter,
            _sort: PropertySort,
            _limit: usize,
        ) -> Result<Vec<calendar_sync::Property>, StoreError> {
            Ok(Vec::new())
        }

        async fn find_by_id(&self, _id: Uuid) -> Result<Option<calendar_sync::Property>, StoreError> {
            Ok(None)
        }

        async fn update_by_id(&self, id: Uuid, _fields: &SyncWriteback) -> Result<(), StoreError> {
            Err(StoreError::NotFound(id))
        }

        async fn count_matching(&self, _filter: &PropertyFilter) -> Result<i64, StoreError> {
            Ok(0)
        }
    }

    fn scheduler(config: SyncConfig) -> Arc<SyncScheduler> {
        let extractor =
            RemoteExtractionClient::new(&config.extraction_service_url, Duration::from_secs(5))
                .unwrap();
        Arc::new(SyncScheduler::new(
            Arc::new(EmptyStore),
            Arc::new(extractor),
            Arc::new(SystemClock),
            config,
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_stop() {
        let mut triggers = CronTriggers::new(scheduler(SyncConfig::default()));
        assert!(!triggers.is_running());

        triggers.start().await.unwrap();
        assert!(triggers.is_running());

        triggers.stop().await.unwrap();
        assert!(!triggers.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_cron_is_rejected() {
        let mut triggers = CronTriggers::new(scheduler(SyncConfig {
            daily_sync_cron: "every day at two".to_string(),
            ..Default::default()
        }));

        assert!(triggers.start().await.is_err());
        assert!(!triggers.is_running());
    }

    #[tokio::test]
    async fn test_priority_trigger_with_nothing_due() {
        let scheduler = scheduler(SyncConfig::default());
        let outcome = scheduler.run_priority_sync().await;
        assert!(matches!(outcome, BatchOutcome::Completed(ref s) if s.selected == 0));

        report_health(&scheduler).await;
        assert!(!scheduler.is_sync_running());
    }
}
