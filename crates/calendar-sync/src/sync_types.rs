use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain key used when a property's public URL has no parseable host
pub const UNKNOWN_DOMAIN: &str = "unknown";

/// A rental property as seen by the sync scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Unique identifier for the property
    pub id: Uuid,
    /// Only active properties are synced
    pub active: bool,
    /// Public listing URL whose calendar is pulled
    pub public_url: Option<String>,
    /// Priority rank, 1 (highest) to 5 (lowest)
    pub sync_frequency: i32,
    /// When the calendar was last synced
    pub last_synced: Option<DateTime<Utc>>,
    /// How long the last sync took, in milliseconds
    pub last_sync_duration: Option<i64>,
    /// Whether the last sync extracted the calendar
    pub sync_successful: Option<bool>,
}

impl Property {
    /// Whether the property has a non-empty public URL
    pub fn has_public_url(&self) -> bool {
        self.public_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Hostname of the public URL, or [`UNKNOWN_DOMAIN`]
    pub fn domain(&self) -> String {
        domain_of(self.public_url.as_deref())
    }
}

/// Parse the hostname out of a URL, mapping anything unparseable to [`UNKNOWN_DOMAIN`]
pub fn domain_of(url: Option<&str>) -> String {
    url.and_then(|raw| url::Url::parse(raw.trim()).ok())
        .and_then(|parsed| parsed.host_str().map(str::to_owned))
        .unwrap_or_else(|| UNKNOWN_DOMAIN.to_string())
}

/// Result returned by the calendar extraction service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    /// Whether the calendar was extracted
    pub success: bool,
    /// Number of booked ranges found, when reported
    #[serde(default)]
    pub events_found: Option<u32>,
    /// Optional detail from the extraction service
    #[serde(default)]
    pub message: Option<String>,
}

/// Fields written back to the property after a successful sync
#[derive(Debug, Clone, PartialEq)]
pub struct SyncWriteback {
    /// Time the sync finished
    pub last_synced: DateTime<Utc>,
    /// Duration of the extraction call in milliseconds
    pub last_sync_duration: i64,
    /// Whether the extraction reported success
    pub sync_successful: bool,
}

/// Outcome of a manual sync request, rendered directly by callers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManualSyncResult {
    /// Whether the sync ran and extracted the calendar
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Milliseconds to wait before retrying, when throttled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_time: Option<u64>,
}

impl ManualSyncResult {
    pub(crate) fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            estimated_wait_time: None,
        }
    }

    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            estimated_wait_time: None,
        }
    }

    pub(crate) fn retry_after(message: impl Into<String>, wait_ms: u64) -> Self {
        Self {
            success: false,
            message: message.into(),
            estimated_wait_time: Some(wait_ms),
        }
    }
}

/// Classification of a sync failure, used to adapt the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// The remote site is throttling us (HTTP 429 or equivalent)
    RateLimited,
    /// The remote site refused access (HTTP 401/403 or equivalent)
    Blocked,
    /// A failure that may succeed on retry
    Transient,
    /// A failure that will not go away by retrying
    Fatal,
}

impl SyncErrorKind {
    /// Classify a free-form error message
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if lowered.contains("rate limit") || lowered.contains("429") {
            SyncErrorKind::RateLimited
        } else if lowered.contains("blocked") || lowered.contains("403") {
            SyncErrorKind::Blocked
        } else {
            SyncErrorKind::Transient
        }
    }
}

/// Error raised by the calendar extraction boundary
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind:?} extraction error: {message}")]
pub struct ExtractionError {
    /// Failure classification
    pub kind: SyncErrorKind,
    /// Detail for logs
    pub message: String,
}

impl ExtractionError {
    /// Create an error with an explicit kind
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an error whose kind is inferred from its message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: SyncErrorKind::from_message(&message),
            message,
        }
    }
}

/// Errors from the property store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Property not found
    #[error("Property {0} not found")]
    NotFound(Uuid),

    /// Data format error
    #[error("Data format error: {0}")]
    DataFormat(String),
}

/// Errors raised while syncing
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// Too many property syncs in flight
    #[error("Concurrency limit reached: {current} syncs in flight, maximum is {max}")]
    ConcurrencyLimit {
        /// In-flight syncs including the rejected one
        current: usize,
        /// Configured maximum
        max: usize,
    },

    /// Calendar extraction failed
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Property store failed
    #[error("Property store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Classification used by the adaptive error handler
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::ConcurrencyLimit { .. } => SyncErrorKind::Transient,
            SyncError::Extraction(e) => e.kind,
            SyncError::Store(StoreError::Database(_)) => SyncErrorKind::Transient,
            SyncError::Store(_) => SyncErrorKind::Fatal,
        }
    }

    /// Message safe to show to an end user
    pub fn user_message(&self) -> &'static str {
        if let SyncError::ConcurrencyLimit { .. } = self {
            return "Sync failed: too many syncs in progress, please retry later";
        }

        match self.kind() {
            SyncErrorKind::RateLimited => {
                "Sync failed: the listing site is rate limiting requests, please retry later"
            }
            SyncErrorKind::Blocked => "Sync failed: the listing site refused access",
            SyncErrorKind::Transient | SyncErrorKind::Fatal => {
                "Sync failed: the calendar could not be retrieved"
            }
        }
    }
}
