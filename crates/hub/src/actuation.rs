//! Pump activation commands.

use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::db::Db;
use crate::error::{HubError, HubResult};
use crate::mqtt::{pump_command_topic, CommandPublisher};
use crate::state::SharedStatus;

/// Longest pump run a single command may request.
pub const MAX_DURATION_MS: i64 = 60_000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateWatering {
    #[serde(default)]
    pub device_external_id: String,
    /// Signed and wide so negative or oversized values reach validation.
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Clone)]
pub struct ActuationService {
    db: Db,
    publisher: Arc<dyn CommandPublisher>,
    status: SharedStatus,
    pump_channel: u8,
}

impl ActuationService {
    pub fn new(
        db: Db,
        publisher: Arc<dyn CommandPublisher>,
        status: SharedStatus,
        pump_channel: u8,
    ) -> Self {
        Self {
            db,
            publisher,
            status,
            pump_channel,
        }
    }

    /// Validate, look the device up (never creating it), and publish the
    /// duration. Success means the transport accepted the publish.
    pub async fn activate(&self, device_external_id: &str, duration_ms: i64) -> HubResult<()> {
        if device_external_id.is_empty() {
            return Err(HubError::invalid_argument("deviceExternalId is required"));
        }
        if duration_ms == 0 {
            return Err(HubError::invalid_argument("durationMs is required"));
        }
        if duration_ms < 0 {
            return Err(HubError::invalid_argument(format!(
                "durationMs {duration_ms} is negative"
            )));
        }
        if duration_ms > MAX_DURATION_MS {
            return Err(HubError::invalid_argument(format!(
                "durationMs {duration_ms} exceeds {MAX_DURATION_MS}"
            )));
        }

        let device = self.db.find_device_by_external_id(device_external_id).await?;
        let topic = pump_command_topic(&device.external_id, self.pump_channel);

        self.publisher
            .publish(topic.clone(), duration_ms.to_string().into_bytes())
            .await?;

        info!(device = %device.external_id, %topic, duration_ms, "pump command sent");
        let mut st = self.status.write().await;
        st.record_command(format!("{} pump {duration_ms}ms", device.external_id));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
