//! Telemetry ingestion: one inbound status message in, at most one persisted
//! reading out.
//!
//! ```text
//! Received ──parse topic──▶ Parsed ──resolve device──▶ DeviceResolved ──insert──▶ Persisted
//!     └──────────────┴── any failure: log, count, drop (no retry) ──┘
//! ```

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_LOCATION;
use crate::db::{Db, Device};
use crate::error::{HubError, HubResult, TopicError};
use crate::mqtt::{parse_moisture_payload, parse_status_topic, SOIL_MOISTURE};
use crate::state::SharedStatus;

/// What a successfully ingested message produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub device: Device,
    pub value: f64,
    pub ts: OffsetDateTime,
}

#[derive(Clone)]
pub struct Ingestor {
    db: Db,
    status: SharedStatus,
    permits: Arc<Semaphore>,
}

impl Ingestor {
    pub fn new(db: Db, status: SharedStatus, workers: usize) -> Self {
        Self {
            db,
            status,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Process one message. `received_at` is the hub's clock at delivery;
    /// device-supplied times are never used.
    pub async fn ingest(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> HubResult<Ingested> {
        let parsed = parse_status_topic(topic)?;
        if parsed.metric != SOIL_MOISTURE {
            return Err(TopicError::UnsupportedMetric(parsed.metric.to_string()).into());
        }

        let value = parse_moisture_payload(payload)?;

        let device = self
            .db
            .resolve_or_create(parsed.device_external_id, SOIL_MOISTURE, DEFAULT_LOCATION)
            .await?;

        self.db.insert_reading(device.id, received_at, value).await?;

        Ok(Ingested {
            device,
            value,
            ts: received_at,
        })
    }

    /// Ingest and record the outcome. Never returns an error: a failed
    /// message is logged and dropped so later messages keep flowing.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let received_at = OffsetDateTime::now_utc();
        match self.ingest(topic, payload, received_at).await {
            Ok(ing) => {
                debug!(
                    device = %ing.device.external_id,
                    value = ing.value,
                    ts = %ing.ts,
                    "reading stored"
                );
                let mut st = self.status.write().await;
                st.record_reading(&ing.device.external_id, ing.value);
            }
            Err(e) => {
                log_drop(topic, &e);
                let mut st = self.status.write().await;
                st.record_dropped(format!("dropped message on {topic}: {e}"));
            }
        }
    }

    /// Hand a message to its own task. Waits for a free permit first, so a
    /// stalled store back-pressures the broker loop instead of piling up
    /// tasks.
    pub async fn dispatch(&self, topic: String, payload: Vec<u8>) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!(%topic, "ingest permit pool closed, dropping message");
                return;
            }
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.handle_message(&topic, &payload).await;
            drop(permit);
        });
    }
}

fn log_drop(topic: &str, e: &HubError) {
    if e.is_malformed_input() {
        warn!(%topic, error = %e, "dropping malformed message");
    } else {
        error!(%topic, error = %e, "dropping message, storage failure");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
