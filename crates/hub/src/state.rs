use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStatus = Arc<RwLock<HubStatus>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct HubStatus {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub counters: Counters,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub messages_ingested: u64,
    pub messages_dropped: u64,
    pub commands_sent: u64,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub counters: Counters,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubStatus {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            counters: Counters::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedStatus {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a persisted reading.
    pub fn record_reading(&mut self, device_external_id: &str, value: f64) {
        self.counters.messages_ingested += 1;
        self.push_event(EventKind::Reading, format!("{device_external_id}={value}"));
    }

    /// Record an inbound message that was dropped.
    pub fn record_dropped(&mut self, detail: String) {
        self.counters.messages_dropped += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Record a command accepted by the transport.
    pub fn record_command(&mut self, detail: String) {
        self.counters.commands_sent += 1;
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            counters: self.counters,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for HubStatus {
    fn default() -> Self {
        Self::new()
    }
}
