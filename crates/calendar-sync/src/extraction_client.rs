use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::sync_types::{ExtractionError, ExtractionResult, Property, SyncErrorKind};

/// Pulls a property's calendar from its public listing
#[async_trait::async_trait]
pub trait CalendarExtractor: Send + Sync {
    /// Fetch and import the calendar for `property`
    async fn scrape_calendar(
        &self,
        property: &Property,
    ) -> Result<ExtractionResult, ExtractionError>;
}

/// Client for the companion calendar extraction service
pub struct RemoteExtractionClient {
    client: Client,
    base_url: String,
}

/// Request body sent to the extraction service
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionRequest<'a> {
    property_id: Uuid,
    public_url: &'a str,
}

impl RemoteExtractionClient {
    /// Create a new extraction service client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .user_agent(concat!("calendar-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ExtractionError::new(
                    SyncErrorKind::Fatal,
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Map a non-success HTTP status from the extraction service to an error.
    ///
    /// The service relays upstream failures in its body, so 5xx bodies are
    /// classified by message before falling back to a transient error.
    fn error_for_status(status: u16, body: &str) -> ExtractionError {
        let detail = format!("HTTP {}: {}", status, body.trim());
        match status {
            429 => ExtractionError::new(SyncErrorKind::RateLimited, detail),
            401 | 403 => ExtractionError::new(SyncErrorKind::Blocked, detail),
            500..=599 => ExtractionError::new(SyncErrorKind::from_message(body), detail),
            _ => ExtractionError::new(SyncErrorKind::Fatal, detail),
        }
    }
}

#[async_trait::async_trait]
impl CalendarExtractor for RemoteExtractionClient {
    async fn scrape_calendar(
        &self,
        property: &Property,
    ) -> Result<ExtractionResult, ExtractionError> {
        let public_url = property.public_url.as_deref().unwrap_or_default();
        debug!("Requesting calendar extraction for property {}", property.id);

        let response = self
            .client
            .post(format!("{}/extract", self.base_url))
            .json(&ExtractionRequest {
                property_id: property.id,
                public_url,
            })
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() || e.is_connect() {
                    SyncErrorKind::Transient
                } else {
                    SyncErrorKind::Fatal
                };
                ExtractionError::new(kind, format!("HTTP request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::error_for_status(status.as_u16(), &body));
        }

        response.json::<ExtractionResult>().await.map_err(|e| {
            ExtractionError::new(
                SyncErrorKind::Fatal,
                format!("Failed to parse response: {}", e),
            )
        })
    }
}
