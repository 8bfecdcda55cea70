use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::scheduler::SyncScheduler;
use crate::sync_types::ManualSyncResult;

/// Minimum time between manual syncs of one property
const MANUAL_MIN_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Minimum time between forced manual syncs of one property
const FORCED_MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Courtesy pause before a manual sync
const MANUAL_DELAY: Duration = Duration::from_secs(3);
/// Courtesy pause before a forced manual sync
const FORCED_DELAY: Duration = Duration::from_secs(1);

impl SyncScheduler {
    /// Sync one property on demand.
    ///
    /// Never fails: every rejection comes back as a `ManualSyncResult` whose
    /// message can be shown to the host as-is. `force` overrides the
    /// emergency stop and the overload check, and shortens the throttle.
    pub async fn trigger_manual_sync(&self, property_id: Uuid, force: bool) -> ManualSyncResult {
        if self.is_emergency_stop_active() && !force {
            return ManualSyncResult::failure(
                "Calendar sync is paused by an emergency stop, please try again later",
            );
        }

        let property = match self.store().find_by_id(property_id).await {
            Ok(Some(property)) => property,
            Ok(None) => return ManualSyncResult::failure("Property not found"),
            Err(e) => {
                error!("Failed to load property {} for manual sync: {}", property_id, e);
                return ManualSyncResult::failure("Unable to load property, please try again later");
            }
        };

        if !property.active {
            return ManualSyncResult::failure("Property is not active");
        }

        if !property.has_public_url() {
            return ManualSyncResult::failure("Property has no public calendar URL configured");
        }

        let min_interval = if force {
            FORCED_MIN_INTERVAL
        } else {
            MANUAL_MIN_INTERVAL
        };
        if let Some(last_synced) = property.last_synced {
            let elapsed = self
                .clock()
                .now()
                .signed_duration_since(last_synced)
                .to_std()
                .unwrap_or_default();

            if elapsed < min_interval {
                let wait = min_interval - elapsed;
                info!(
                    "Manual sync of property {} throttled, {}ms remaining",
                    property_id,
                    wait.as_millis()
                );
                return ManualSyncResult::retry_after(
                    format!(
                        "Property was synced recently, please wait {} seconds",
                        wait.as_secs().max(1)
                    ),
                    u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                );
            }
        }

        if !force && self.current_sync_count() >= self.config().max_concurrent_syncs {
            warn!(
                "Manual sync of property {} rejected, {} syncs in flight",
                property_id,
                self.current_sync_count()
            );
            return ManualSyncResult::failure("System is busy syncing other calendars, please retry later");
        }

        sleep(if force { FORCED_DELAY } else { MANUAL_DELAY }).await;

        info!("Manual sync of property {} started (force: {})", property_id, force);
        match self.sync_property_with_metrics(&property).await {
            Ok(result) if result.success => ManualSyncResult::success("Calendar synced successfully"),
            Ok(_) => ManualSyncResult::failure("Sync finished but the calendar could not be read"),
            Err(e) => {
                warn!("Manual sync of property {} failed: {}", property_id, e);
                ManualSyncResult::failure(e.user_message())
            }
        }
    }
}
