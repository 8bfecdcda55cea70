//! In-memory collaborators for scheduler tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::extraction_client::CalendarExtractor;
use crate::property_store::{PropertyFilter, PropertySort, PropertyStore};
use crate::scheduler::SyncScheduler;
use crate::sync_types::*;

/// Property store backed by a vector
#[derive(Default)]
pub struct InMemoryPropertyStore {
    properties: Mutex<Vec<Property>>,
    updates: Mutex<Vec<(Uuid, SyncWriteback)>>,
    requested_limits: Mutex<Vec<usize>>,
    failing: Mutex<bool>,
}

impl InMemoryPropertyStore {
    pub fn insert(&self, property: Property) {
        self.properties.lock().unwrap().push(property);
    }

    pub fn updates(&self) -> Vec<(Uuid, SyncWriteback)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn requested_limits(&self) -> Vec<usize> {
        self.requested_limits.lock().unwrap().clone()
    }

    /// Make every subsequent query fail
    pub fn fail_queries(&self) {
        *self.failing.lock().unwrap() = true;
    }

    fn check_failing(&self) -> Result<(), StoreError> {
        if *self.failing.lock().unwrap() {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PropertyStore for InMemoryPropertyStore {
    async fn find_due_properties(
        &self,
        filter: &PropertyFilter,
        sort: PropertySort,
        limit: usize,
    ) -> Result<Vec<Property>, StoreError> {
        self.requested_limits.lock().unwrap().push(limit);
        self.check_failing()?;

        let mut matching: Vec<Property> = self
            .properties
            .lock()
            .unwrap()
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();

        match sort {
            PropertySort::OldestSyncFirst => matching.sort_by(|a, b| {
                // None sorts before Some, matching NULLS FIRST
                a.last_synced
                    .cmp(&b.last_synced)
                    .then(a.sync_frequency.cmp(&b.sync_frequency))
                    .then(a.id.cmp(&b.id))
            }),
        }

        matching.truncate(limit);
        Ok(matching)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Property>, StoreError> {
        self.check_failing()?;
        Ok(self
            .properties
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn update_by_id(&self, id: Uuid, fields: &SyncWriteback) -> Result<(), StoreError> {
        self.check_failing()?;
        let mut properties = self.properties.lock().unwrap();
        let property = properties
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound(id))?;

        property.last_synced = Some(fields.last_synced);
        property.last_sync_duration = Some(fields.last_sync_duration);
        property.sync_successful = Some(fields.sync_successful);
        self.updates.lock().unwrap().push((id, fields.clone()));
        Ok(())
    }

    async fn count_matching(&self, filter: &PropertyFilter) -> Result<i64, StoreError> {
        self.check_failing()?;
        let count = self
            .properties
            .lock()
            .unwrap()
            .iter()
            .filter(|p| filter.matches(p))
            .count();
        Ok(count as i64)
    }
}

/// Extractor that succeeds unless told otherwise, optionally after a delay
#[derive(Default)]
pub struct ScriptedExtractor {
    failures: Mutex<HashMap<Uuid, ExtractionError>>,
    unsuccessful: Mutex<Vec<Uuid>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<(Uuid, String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn fail_with(&self, id: Uuid, error: ExtractionError) {
        self.failures.lock().unwrap().insert(id, error);
    }

    /// Return a result with `success: false` for this property
    pub fn report_unsuccessful(&self, id: Uuid) {
        self.unsuccessful.lock().unwrap().push(id);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().iter().map(|(id, _, _)| *id).collect()
    }

    pub fn call_domains(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, domain, _)| domain.clone())
            .collect()
    }

    /// When each extraction call started
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, at)| *at)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CalendarExtractor for ScriptedExtractor {
    async fn scrape_calendar(
        &self,
        property: &Property,
    ) -> Result<ExtractionResult, ExtractionError> {
        self.calls
            .lock()
            .unwrap()
            .push((property.id, property.domain(), Instant::now()));
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().unwrap().get(&property.id) {
            return Err(error.clone());
        }

        let success = !self.unsuccessful.lock().unwrap().contains(&property.id);
        Ok(ExtractionResult {
            success,
            events_found: success.then_some(12),
            message: None,
        })
    }
}

/// Clock frozen at a fixed instant
pub struct ManualClock {
    now: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// A scheduler wired to in-memory collaborators
pub struct Harness {
    pub scheduler: Arc<SyncScheduler>,
    pub store: Arc<InMemoryPropertyStore>,
    pub extractor: Arc<ScriptedExtractor>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(InMemoryPropertyStore::default());
        let extractor = Arc::new(ScriptedExtractor::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            extractor.clone(),
            clock.clone(),
            config,
        ));

        Self {
            scheduler,
            store,
            extractor,
            clock,
        }
    }
}

/// An active, never-synced, mid-priority property
pub fn property_at(url: &str) -> Property {
    Property {
        id: Uuid::new_v4(),
        active: true,
        public_url: Some(url.to_string()),
        sync_frequency: 3,
        last_synced: None,
        last_sync_duration: None,
        sync_successful: None,
    }
}

pub fn with_last_synced(mut property: Property, at: DateTime<Utc>) -> Property {
    property.last_synced = Some(at);
    property
}

pub fn with_rank(mut property: Property, rank: i32) -> Property {
    property.sync_frequency = rank;
    property
}

pub fn hours(n: i64) -> chrono::Duration {
    chrono::Duration::hours(n)
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Wait, a second at a time, until the extractor has seen `count` calls
pub async fn wait_for_calls(extractor: &ScriptedExtractor, count: usize) {
    while extractor.calls().len() < count {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
