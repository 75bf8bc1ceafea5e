//! Read side of the API: devices, raw readings, hourly averages.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::{Db, Device, HourlyAverage, Reading};
use crate::error::{HubError, HubResult};

/// Width of the fixed hourly-average view.
const AVERAGE_WINDOW: Duration = Duration::hours(24);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: String,
    pub external_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
}

impl From<Device> for DeviceView {
    fn from(d: Device) -> Self {
        Self {
            id: d.id.to_string(),
            external_id: d.external_id,
            kind: d.kind,
            location: d.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingView {
    pub device_external_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyAverageView {
    pub device_external_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub average_value: f64,
}

/// Raw range request. Times stay strings and are parsed by the service, so
/// a malformed timestamp reports which field was wrong.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingsRange {
    #[serde(default)]
    pub device_external_id: String,
    pub start: Option<String>,
    pub end: Option<String>,
}

fn parse_time(field: &str, raw: &str) -> HubResult<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|e| HubError::invalid_argument(format!("{field} '{raw}' is not RFC 3339: {e}")))
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct QueryService {
    db: Db,
}

impl QueryService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list_devices(&self) -> HubResult<Vec<DeviceView>> {
        let devices = self.db.list_devices().await?;
        Ok(devices.into_iter().map(DeviceView::from).collect())
    }

    pub async fn get_device(&self, id: &str) -> HubResult<DeviceView> {
        let id = Uuid::parse_str(id.trim())
            .map_err(|_| HubError::invalid_argument(format!("device id '{id}' is not a UUID")))?;
        Ok(self.db.get_device(id).await?.into())
    }

    async fn resolve(&self, external_id: &str) -> HubResult<Device> {
        if external_id.is_empty() {
            return Err(HubError::invalid_argument("deviceExternalId is required"));
        }
        self.db.find_device_by_external_id(external_id).await
    }

    pub async fn readings_in_range(&self, req: &ReadingsRange) -> HubResult<Vec<ReadingView>> {
        self.readings_in_range_at(req, OffsetDateTime::now_utc()).await
    }

    /// `now` stands in for a missing `end`.
    pub async fn readings_in_range_at(
        &self,
        req: &ReadingsRange,
        now: OffsetDateTime,
    ) -> HubResult<Vec<ReadingView>> {
        let start = match req.start.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_time("start", raw)?,
            _ => return Err(HubError::invalid_argument("start is required")),
        };
        let end = match req.end.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_time("end", raw)?,
            _ => now,
        };
        if start > end {
            return Err(HubError::invalid_argument("start is after end"));
        }

        let device = self.resolve(&req.device_external_id).await?;
        let readings = self.db.readings_in_range(device.id, start, end).await?;
        Ok(readings
            .into_iter()
            .map(|r: Reading| ReadingView {
                device_external_id: device.external_id.clone(),
                timestamp: r.ts,
                value: r.value,
            })
            .collect())
    }

    pub async fn hourly_averages(&self, external_id: &str) -> HubResult<Vec<HourlyAverageView>> {
        let device = self.resolve(external_id).await?;
        let now = OffsetDateTime::now_utc();
        let averages = self
            .db
            .hourly_averages(device.id, now - AVERAGE_WINDOW, now)
            .await?;
        Ok(averages
            .into_iter()
            .map(|a: HourlyAverage| HourlyAverageView {
                device_external_id: device.external_id.clone(),
                bucket_start: a.bucket_start,
                average_value: a.average,
            })
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
