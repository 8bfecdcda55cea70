use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::sync_types::{Property, StoreError, SyncWriteback};

/// Selection of syncable properties.
///
/// Every filter implies `active = true` and a non-empty public URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyFilter {
    /// Only properties never synced or last synced before this time
    pub synced_before: Option<DateTime<Utc>>,
    /// Only properties with this priority rank
    pub sync_frequency: Option<i32>,
}

impl PropertyFilter {
    /// Every active property with a public URL
    pub fn eligible() -> Self {
        Self::default()
    }

    /// Eligible properties not synced since `cutoff`
    pub fn due(cutoff: DateTime<Utc>) -> Self {
        Self {
            synced_before: Some(cutoff),
            sync_frequency: None,
        }
    }

    /// Restrict to one priority rank
    pub fn with_sync_frequency(mut self, rank: i32) -> Self {
        self.sync_frequency = Some(rank);
        self
    }

    /// Whether a property passes the filter
    pub fn matches(&self, property: &Property) -> bool {
        property.active
            && property.has_public_url()
            && self.sync_frequency.is_none_or(|rank| property.sync_frequency == rank)
            && match (self.synced_before, property.last_synced) {
                (None, _) | (Some(_), None) => true,
                (Some(cutoff), Some(last)) => last < cutoff,
            }
    }
}

/// Result ordering for due-property queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySort {
    /// Never-synced first, then oldest `last_synced`, then rank 1 before
    /// rank 5, then id
    OldestSyncFirst,
}

/// Persistence for the property fields the scheduler reads and writes
#[async_trait::async_trait]
pub trait PropertyStore: Send + Sync {
    /// Properties matching `filter`, ordered by `sort`, at most `limit`
    async fn find_due_properties(
        &self,
        filter: &PropertyFilter,
        sort: PropertySort,
        limit: usize,
    ) -> Result<Vec<Property>, StoreError>;

    /// A single property by id
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Property>, StoreError>;

    /// Write back the outcome of a sync
    async fn update_by_id(&self, id: Uuid, fields: &SyncWriteback) -> Result<(), StoreError>;

    /// Number of properties matching `filter`
    async fn count_matching(&self, filter: &PropertyFilter) -> Result<i64, StoreError>;
}

/// [`PropertyStore`] backed by the `properties` table in PostgreSQL
pub struct PgPropertyStore {
    pool: PgPool,
}

impl PgPropertyStore {
    /// Creates a new instance of `PgPropertyStore` with the provided database connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn order_by(sort: PropertySort) -> &'static str {
        match sort {
            PropertySort::OldestSyncFirst => {
                "ORDER BY last_synced ASC NULLS FIRST, sync_frequency ASC, id ASC"
            }
        }
    }

    fn map_row(row: &PgRow) -> Result<Property, StoreError> {
        Ok(Property {
            id: row.try_get("id")?,
            active: row.try_get("active")?,
            public_url: row.try_get("public_url")?,
            sync_frequency: row.try_get("sync_frequency")?,
            last_synced: row.try_get("last_synced")?,
            last_sync_duration: row.try_get("last_sync_duration")?,
            sync_successful: row.try_get("sync_successful")?,
        })
    }
}

const PROPERTY_COLUMNS: &str = "id, active, public_url, sync_frequency, last_synced, \
                                last_sync_duration, sync_successful";

const FILTER_CLAUSE: &str = r#"
    WHERE active = true
      AND public_url IS NOT NULL
      AND btrim(public_url) <> ''
      AND ($1::timestamptz IS NULL OR last_synced IS NULL OR last_synced < $1)
      AND ($2::int4 IS NULL OR sync_frequency = $2)
"#;

#[async_trait::async_trait]
impl PropertyStore for PgPropertyStore {
    async fn find_due_properties(
        &self,
        filter: &PropertyFilter,
        sort: PropertySort,
        limit: usize,
    ) -> Result<Vec<Property>, StoreError> {
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::DataFormat(format!("limit {limit} out of range")))?;

        let query = format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties {FILTER_CLAUSE} {} LIMIT $3",
            Self::order_by(sort)
        );

        let rows = sqlx::query(&query)
            .bind(filter.synced_before)
            .bind(filter.sync_frequency)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Property>, StoreError> {
        let query = format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = $1");

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn update_by_id(&self, id: Uuid, fields: &SyncWriteback) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE properties
            SET last_synced = $1,
                last_sync_duration = $2,
                sync_successful = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(fields.last_synced)
        .bind(fields.last_sync_duration)
        .bind(fields.sync_successful)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }

    async fn count_matching(&self, filter: &PropertyFilter) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) AS count FROM properties {FILTER_CLAUSE}");

        let row = sqlx::query(&query)
            .bind(filter.synced_before)
            .bind(filter.sync_frequency)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("count")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property(
        active: bool,
        url: Option<&str>,
        rank: i32,
        last: Option<DateTime<Utc>>,
    ) -> Property {
        Property {
            id: Uuid::new_v4(),
            active,
            public_url: url.map(str::to_string),
            sync_frequency: rank,
            last_synced: last,
            last_sync_duration: None,
            sync_successful: None,
        }
    }

    #[test]
    fn test_filter_requires_active_with_url() {
        let filter = PropertyFilter::eligible();
        assert!(filter.matches(&property(true, Some("https://airbnb.com/r/1"), 3, None)));
        assert!(!filter.matches(&property(false, Some("https://airbnb.com/r/1"), 3, None)));
        assert!(!filter.matches(&property(true, None, 3, None)));
        assert!(!filter.matches(&property(true, Some("  "), 3, None)));
    }

    #[test]
    fn test_due_filter() {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::hours(48);
        let filter = PropertyFilter::due(cutoff);
        let url = Some("https://airbnb.com/r/1");

        assert!(filter.matches(&property(true, url, 3, None)));
        let stale = cutoff - chrono::Duration::minutes(1);
        assert!(filter.matches(&property(true, url, 3, Some(stale))));
        assert!(!filter.matches(&property(true, url, 3, Some(now))));

        let priority = filter.with_sync_frequency(1);
        assert!(!priority.matches(&property(true, url, 3, None)));
        assert!(priority.matches(&property(true, url, 1, None)));
    }
}
