use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

use crate::error::{HubError, HubResult, TopicError};

// ---------------------------------------------------------------------------
// Topic layout
// ---------------------------------------------------------------------------

/// First segment of every inbound telemetry topic.
pub(crate) const STATUS_NAMESPACE: &str = "habanero-status";

/// First segment of every outbound command topic.
pub(crate) const CONTROL_NAMESPACE: &str = "habanero-controls";

/// The only metric kind the hub persists.
pub(crate) const SOIL_MOISTURE: &str = "soil-moisture";

/// Wildcard subscription covering every device and metric.
pub(crate) const STATUS_SUBSCRIPTION: &str = "habanero-status/+/+";

/// A parsed `habanero-status/<device>/<metric>` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusTopic<'a> {
    pub(crate) device_external_id: &'a str,
    pub(crate) metric: &'a str,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Parse "habanero-status/<device>/soil-moisture".
pub(crate) fn parse_status_topic(topic: &str) -> Result<StatusTopic<'_>, TopicError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[1].is_empty() {
        return Err(TopicError::MalformedTopic(topic.to_string()));
    }
    if parts[0] != STATUS_NAMESPACE {
        return Err(TopicError::UnrecognizedNamespace(parts[0].to_string()));
    }
    if parts[2] != SOIL_MOISTURE {
        return Err(TopicError::UnsupportedMetric(parts[2].to_string()));
    }
    Ok(StatusTopic {
        device_external_id: parts[1],
        metric: parts[2],
    })
}

/// Parse a UTF-8 decimal moisture value (surrounding whitespace ignored).
pub(crate) fn parse_moisture_payload(payload: &[u8]) -> HubResult<f64> {
    let s = std::str::from_utf8(payload)
        .map_err(|_| HubError::InvalidPayload("payload is not valid UTF-8".to_string()))?
        .trim();
    let value: f64 = s
        .parse()
        .map_err(|e| HubError::InvalidPayload(format!("'{s}': {e}")))?;
    if !value.is_finite() {
        return Err(HubError::InvalidPayload(format!("'{s}' is not a finite number")));
    }
    Ok(value)
}

/// Build "habanero-controls/<device>/pump/<channel>".
pub(crate) fn pump_command_topic(device_external_id: &str, channel: u8) -> String {
    format!("{CONTROL_NAMESPACE}/{device_external_id}/pump/{channel}")
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// Sink for device commands. The broker client in production, a recorder in
/// tests.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> HubResult<()>;
}

#[async_trait]
impl CommandPublisher for AsyncClient {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> HubResult<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| HubError::TransportUnavailable(e.to_string()))
    }
}


// ===========================================================================
// Tests
// ===========================================================================
