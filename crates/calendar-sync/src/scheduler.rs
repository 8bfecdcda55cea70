use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::adaptive::{
    DelayMultiplier, RESUME_DELAY_MULTIPLIER, adaptive_lookback, backoff_delay,
    circuit_breaker_tripped, domain_delay, inter_domain_delay, randomized_start_delay,
};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::domain_metrics::MetricsTracker;
use crate::extraction_client::CalendarExtractor;
use crate::property_store::{PropertyFilter, PropertySort, PropertyStore};
use crate::sync_types::*;

/// Hard ceiling on properties pulled by one daily batch
pub const MAX_PROPERTIES_PER_BATCH: usize = 4;
/// Hard ceiling on properties pulled by one priority batch
pub const MAX_PRIORITY_PROPERTIES: usize = 2;
/// Rank handled by the priority batch
pub const TOP_PRIORITY_RANK: i32 = 1;
/// Priority properties are due again after this long
const PRIORITY_LOOKBACK: Duration = Duration::from_secs(6 * 60 * 60);
/// Minimum gap between two priority syncs
const PRIORITY_MIN_DELAY: Duration = Duration::from_secs(20);
/// Pause after a failed priority sync
const PRIORITY_FAILURE_DELAY: Duration = Duration::from_secs(2 * 60);
/// How often an emergency stop checks whether the running batch has drained
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How many drain checks before the running flag is force-cleared
const DRAIN_MAX_POLLS: u32 = 60;

/// Process-wide scheduler flags and counters
#[derive(Debug)]
pub(crate) struct SchedulerState {
    is_sync_running: AtomicBool,
    is_emergency_stop_active: AtomicBool,
    current_sync_count: AtomicUsize,
    adaptive: RwLock<AdaptiveState>,
}

#[derive(Debug, Default)]
struct AdaptiveState {
    delay_multiplier: DelayMultiplier,
    last_sync_duration: Option<Duration>,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            is_sync_running: AtomicBool::new(false),
            is_emergency_stop_active: AtomicBool::new(false),
            current_sync_count: AtomicUsize::new(0),
            adaptive: RwLock::new(AdaptiveState::default()),
        }
    }
}

/// Marks a batch as running; clears the flag and the in-flight counter on drop
struct BatchGuard<'a> {
    state: &'a SchedulerState,
}

impl<'a> BatchGuard<'a> {
    fn try_acquire(state: &'a SchedulerState) -> Option<Self> {
        state
            .is_sync_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { state })
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.state.is_sync_running.store(false, Ordering::SeqCst);
        self.state.current_sync_count.store(0, Ordering::SeqCst);
    }
}

/// Counts one in-flight property sync for as long as it lives
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
    count: usize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, count }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // A finished batch may already have reset the counter to zero
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

/// Why a scheduled batch did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Calendar sync is disabled
    SyncDisabled,
    /// Respectful sync mode is disabled
    RespectfulSyncDisabled,
    /// The emergency stop is active
    EmergencyStop,
    /// Another batch is still running
    AlreadyRunning,
    /// Too many recent failures
    CircuitBreakerOpen,
}

/// Counts from one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Properties selected for the batch
    pub selected: usize,
    /// Syncs that completed
    pub succeeded: usize,
    /// Syncs that failed
    pub failed: usize,
    /// Whether an emergency stop cut the batch short
    pub stopped_early: bool,
}

/// Outcome of a scheduled batch trigger
#[derive(Debug)]
pub enum BatchOutcome {
    /// A guard rejected the trigger
    Skipped(SkipReason),
    /// The batch ran to the end or until an emergency stop
    Completed(BatchSummary),
    /// The batch failed before or outside its per-property loop
    Failed(SyncError),
}

/// Respectful adaptive calendar-sync scheduler
pub struct SyncScheduler {
    store: Arc<dyn PropertyStore>,
    extractor: Arc<dyn CalendarExtractor>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    pub(crate) state: SchedulerState,
    pub(crate) metrics: RwLock<MetricsTracker>,
    stop_signal: Notify,
}

impl SyncScheduler {
    /// Create a scheduler over the given collaborators
    pub fn new(
        store: Arc<dyn PropertyStore>,
        extractor: Arc<dyn CalendarExtractor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            clock,
            config,
            state: SchedulerState::new(),
            metrics: RwLock::new(MetricsTracker::new()),
            stop_signal: Notify::new(),
        }
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn PropertyStore {
        self.store.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Whether a daily or priority batch is running
    pub fn is_sync_running(&self) -> bool {
        self.state.is_sync_running.load(Ordering::SeqCst)
    }

    /// Whether the emergency stop is active
    pub fn is_emergency_stop_active(&self) -> bool {
        self.state.is_emergency_stop_active.load(Ordering::SeqCst)
    }

    /// Property syncs currently in flight
    pub fn current_sync_count(&self) -> usize {
        self.state.current_sync_count.load(Ordering::SeqCst)
    }

    /// Current global delay multiplier
    pub async fn delay_multiplier(&self) -> f64 {
        self.state.adaptive.read().await.delay_multiplier.value()
    }

    pub(crate) async fn last_sync_duration(&self) -> Option<Duration> {
        self.state.adaptive.read().await.last_sync_duration
    }

    /// Daily batch: syncs the properties that are most overdue.
    pub async fn run_daily_sync(&self) -> BatchOutcome {
        if let Some(reason) = self.precheck() {
            info!("Skipping daily calendar sync: {:?}", reason);
            return BatchOutcome::Skipped(reason);
        }

        let Some(_batch) = BatchGuard::try_acquire(&self.state) else {
            info!("Daily calendar sync already running, skipping this trigger");
            return BatchOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        if self.is_circuit_breaker_tripped().await {
            warn!("Circuit breaker open, aborting daily calendar sync");
            return BatchOutcome::Skipped(SkipReason::CircuitBreakerOpen);
        }

        let multiplier = self.state.adaptive.read().await.delay_multiplier;
        let start_delay = randomized_start_delay(multiplier);
        info!(
            "Starting daily calendar sync in {}s (delay multiplier {:.2})",
            start_delay.as_secs(),
            multiplier.value()
        );
        self.pause(start_delay).await;

        let started = Instant::now();
        let result = self.sync_due_properties().await;
        self.finish_batch(started.elapsed(), result, "Daily").await
    }

    /// Priority batch: syncs up to two top-priority properties.
    pub async fn run_priority_sync(&self) -> BatchOutcome {
        if let Some(reason) = self.precheck() {
            info!("Skipping priority calendar sync: {:?}", reason);
            return BatchOutcome::Skipped(reason);
        }

        let Some(_batch) = BatchGuard::try_acquire(&self.state) else {
            info!("Calendar sync already running, skipping priority trigger");
            return BatchOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        let started = Instant::now();
        let result = self.sync_priority_properties().await;
        self.finish_batch(started.elapsed(), result, "Priority").await
    }

    fn precheck(&self) -> Option<SkipReason> {
        if !self.config.sync_enabled {
            Some(SkipReason::SyncDisabled)
        } else if !self.config.respectful_sync_enabled {
            Some(SkipReason::RespectfulSyncDisabled)
        } else if self.is_emergency_stop_active() {
            Some(SkipReason::EmergencyStop)
        } else {
            None
        }
    }

    async fn finish_batch(
        &self,
        elapsed: Duration,
        result: Result<BatchSummary, SyncError>,
        label: &str,
    ) -> BatchOutcome {
        self.state.adaptive.write().await.last_sync_duration = Some(elapsed);

        match result {
            Ok(summary) => {
                info!(
                    "{} calendar sync finished in {}s: {} succeeded, {} failed of {} selected",
                    label,
                    elapsed.as_secs(),
                    summary.succeeded,
                    summary.failed,
                    summary.selected
                );
                BatchOutcome::Completed(summary)
            }
            Err(e) => {
                error!("{} calendar sync failed: {}", label, e);
                self.handle_sync_error(&e).await;
                BatchOutcome::Failed(e)
            }
        }
    }

    /// Sync the properties that have gone longest without a sync
    async fn sync_due_properties(&self) -> Result<BatchSummary, SyncError> {
        let total_failures = self.metrics.read().await.totals().failures;
        let lookback = adaptive_lookback(total_failures);
        let cutoff = self.clock.now() - chrono::Duration::from_std(lookback).unwrap_or_default();
        let limit = self.config.sync_max_properties.min(MAX_PROPERTIES_PER_BATCH);

        debug!(
            "Looking for properties not synced in {}h (limit {})",
            lookback.as_secs() / 3600,
            limit
        );

        let properties = self
            .store
            .find_due_properties(
                &PropertyFilter::due(cutoff),
                PropertySort::OldestSyncFirst,
                limit,
            )
            .await?;

        self.sync_grouped(properties, BatchPacing::Adaptive).await
    }

    /// Sync up to two top-priority properties with fixed pacing
    async fn sync_priority_properties(&self) -> Result<BatchSummary, SyncError> {
        let cutoff =
            self.clock.now() - chrono::Duration::from_std(PRIORITY_LOOKBACK).unwrap_or_default();
        let filter = PropertyFilter::due(cutoff).with_sync_frequency(TOP_PRIORITY_RANK);

        let properties = self
            .store
            .find_due_properties(&filter, PropertySort::OldestSyncFirst, MAX_PRIORITY_PROPERTIES)
            .await?;

        self.sync_grouped(properties, BatchPacing::Fixed).await
    }

    async fn sync_grouped(
        &self,
        properties: Vec<Property>,
        pacing: BatchPacing,
    ) -> Result<BatchSummary, SyncError> {
        let mut summary = BatchSummary {
            selected: properties.len(),
            ..Default::default()
        };

        if properties.is_empty() {
            info!("No properties due for calendar sync");
            return Ok(summary);
        }

        let groups = group_by_domain(properties);
        let domain_count = groups.len();

        for (index, (domain, properties)) in groups.into_iter().enumerate() {
            debug!("Syncing {} properties on {}", properties.len(), domain);
            let property_count = properties.len();

            for (position, property) in properties.into_iter().enumerate() {
                if self.is_emergency_stop_active() {
                    warn!("Emergency stop active, abandoning calendar sync batch");
                    summary.stopped_early = true;
                    return Ok(summary);
                }

                let more_on_domain = position + 1 < property_count;
                match self.sync_property_with_metrics(&property).await {
                    Ok(_) => {
                        summary.succeeded += 1;
                        if more_on_domain {
                            let delay = self.success_delay(&domain, pacing).await;
                            debug!("Waiting {}ms before next sync on {}", delay.as_millis(), domain);
                            self.pause(delay).await;
                        }
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!("Calendar sync failed for property {}: {}", property.id, e);
                        let delay = self.failure_delay(&domain, pacing).await;
                        debug!("Backing off {}ms after failure on {}", delay.as_millis(), domain);
                        self.pause(delay).await;
                    }
                }
            }

            if index + 1 < domain_count {
                let delay = inter_domain_delay();
                debug!("Waiting {}ms before switching domains", delay.as_millis());
                self.pause(delay).await;
            }
        }

        Ok(summary)
    }

    async fn success_delay(&self, domain: &str, pacing: BatchPacing) -> Duration {
        let base = self.config.min_delay_between_syncs();
        match pacing {
            BatchPacing::Adaptive => {
                let multiplier = self.state.adaptive.read().await.delay_multiplier;
                let metrics = self.metrics.read().await;
                domain_delay(base, metrics.get(domain), multiplier)
            }
            BatchPacing::Fixed => base.max(PRIORITY_MIN_DELAY),
        }
    }

    async fn failure_delay(&self, domain: &str, pacing: BatchPacing) -> Duration {
        match pacing {
            BatchPacing::Adaptive => {
                let metrics = self.metrics.read().await;
                backoff_delay(metrics.get(domain), self.config.backoff_multiplier)
            }
            BatchPacing::Fixed => PRIORITY_FAILURE_DELAY,
        }
    }

    /// Sync one property while recording domain metrics and adapting the
    /// delay multiplier. Every trigger goes through here.
    pub(crate) async fn sync_property_with_metrics(
        &self,
        property: &Property,
    ) -> Result<ExtractionResult, SyncError> {
        let domain = property.domain();
        self.metrics.write().await.begin_attempt(&domain);

        let in_flight = InFlightGuard::enter(&self.state.current_sync_count);
        let max = self.config.max_concurrent_syncs;
        if in_flight.count > max {
            self.record_failure(&domain).await;
            return Err(SyncError::ConcurrencyLimit {
                current: in_flight.count,
                max,
            });
        }

        info!("Syncing calendar for property {} on {}", property.id, domain);
        let started = Instant::now();

        match self.extractor.scrape_calendar(property).await {
            Ok(result) => {
                let elapsed = started.elapsed();
                self.record_success(&domain, elapsed).await;

                let writeback = SyncWriteback {
                    last_synced: self.clock.now(),
                    last_sync_duration: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
                    sync_successful: result.success,
                };
                if let Err(e) = self.store.update_by_id(property.id, &writeback).await {
                    error!("Failed to record sync result for property {}: {}", property.id, e);
                }

                debug!(
                    "Property {} synced in {}ms (success: {})",
                    property.id,
                    elapsed.as_millis(),
                    result.success
                );
                Ok(result)
            }
            Err(e) => {
                self.record_failure(&domain).await;
                Err(SyncError::Extraction(e))
            }
        }
    }

    async fn record_success(&self, domain: &str, elapsed: Duration) {
        self.metrics.write().await.record_success(domain, elapsed);

        if self.config.adaptive_delay_enabled {
            self.state.adaptive.write().await.delay_multiplier.relax();
        }
    }

    async fn record_failure(&self, domain: &str) {
        self.metrics
            .write()
            .await
            .record_failure(domain, self.clock.now());

        if self.config.adaptive_delay_enabled {
            self.state
                .adaptive
                .write()
                .await
                .delay_multiplier
                .tighten(self.config.backoff_multiplier);
        }
    }

    /// Whether the circuit breaker currently refuses new batches
    pub async fn is_circuit_breaker_tripped(&self) -> bool {
        let metrics = self.metrics.read().await;
        circuit_breaker_tripped(self.config.circuit_breaker_enabled, &metrics, self.clock.now())
    }

    /// React to a batch-level failure according to its kind
    pub async fn handle_sync_error(&self, error: &SyncError) {
        match error.kind() {
            SyncErrorKind::RateLimited => {
                let mut adaptive = self.state.adaptive.write().await;
                adaptive.delay_multiplier.escalate();
                warn!(
                    "Rate limit detected, delay multiplier raised to {:.2}",
                    adaptive.delay_multiplier.value()
                );
            }
            SyncErrorKind::Blocked => {
                warn!(
                    "Possible block detected ({}), consider activating the emergency stop",
                    error
                );
            }
            SyncErrorKind::Transient | SyncErrorKind::Fatal => {
                error!("Calendar sync error: {}", error);
            }
        }
    }

    /// Halt all syncs and wait up to a minute for the running batch to drain
    pub async fn emergency_stop(&self, reason: Option<&str>) {
        self.state
            .is_emergency_stop_active
            .store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        warn!(
            "Calendar sync emergency stop activated: {}",
            reason.unwrap_or("no reason given")
        );

        for _ in 0..DRAIN_MAX_POLLS {
            if !self.is_sync_running() {
                info!("Calendar sync drained after emergency stop");
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }

        if self.is_sync_running() {
            self.state.is_sync_running.store(false, Ordering::SeqCst);
            warn!("Calendar sync did not drain in time, running flag forcibly cleared");
        }
    }

    /// Lift the emergency stop and restart cautiously
    pub async fn resume_from_emergency_stop(&self) {
        self.state
            .is_emergency_stop_active
            .store(false, Ordering::SeqCst);
        self.state.adaptive.write().await.delay_multiplier =
            DelayMultiplier::new(RESUME_DELAY_MULTIPLIER);
        info!(
            "Calendar sync resumed, delay multiplier set to {:.1}",
            RESUME_DELAY_MULTIPLIER
        );
    }

    /// Sleep for `delay`, waking early if an emergency stop is raised
    pub(crate) async fn pause(&self, delay: Duration) {
        let stopped = self.stop_signal.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if self.is_emergency_stop_active() {
            return;
        }

        tokio::select! {
            _ = sleep(delay) => {}
            _ = stopped => debug!("Delay interrupted by emergency stop"),
        }
    }
}

/// How a batch paces itself between properties
#[derive(Debug, Clone, Copy)]
enum BatchPacing {
    /// Domain-specific delays and exponential backoff
    Adaptive,
    /// Fixed minimum delay and a flat pause after failures
    Fixed,
}

/// Group properties by domain, keeping domains in first-seen order
fn group_by_domain(properties: Vec<Property>) -> Vec<(String, Vec<Property>)> {
    let mut groups: Vec<(String, Vec<Property>)> = Vec::new();

    for property in properties {
        let domain = property.domain();
        match groups.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, group)) => group.push(property),
            None => groups.push((domain, vec![property])),
        }
    }

    groups
}
