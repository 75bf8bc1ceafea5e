//! Hub configuration: TOML file, environment overrides, validation, and
//! seeding of pre-registered devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::db::Db;
use crate::mqtt::SOIL_MOISTURE;

pub const DEFAULT_LOCATION: &str = "unspecified";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub db_url: String,
    pub web_port: u16,
    pub allowed_origins: Vec<String>,
    pub static_dir: Option<PathBuf>,
    pub debug: bool,
    pub ingest_workers: usize,
    pub pump_channel: u8,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub external_id: String,
    #[serde(rename = "type", default = "default_device_type")]
    pub kind: String,
    #[serde(default = "default_location")]
    pub location: String,
}

fn default_device_type() -> String {
    SOIL_MOISTURE.to_string()
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "habanero-hub-local".to_string(),
            db_url: "sqlite:habanero.db?mode=rwc".to_string(),
            web_port: 5999,
            allowed_origins: Vec::new(),
            static_dir: None,
            debug: false,
            ingest_workers: 16,
            pump_channel: 3,
            devices: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

fn parse_bool(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

impl HubConfig {
    /// Overlay values from a variable lookup. Unparseable numbers are
    /// reported rather than silently ignored.
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("MQTT_HOST") {
            self.mqtt_host = v;
        }
        if let Some(v) = var("MQTT_PORT") {
            self.mqtt_port = v.parse().with_context(|| format!("MQTT_PORT '{v}'"))?;
        }
        match var("MQTT_CLIENT_ID") {
            Some(v) => self.mqtt_client_id = v,
            None => {
                if let Some(host) = var("HOSTNAME").filter(|h| !h.trim().is_empty()) {
                    self.mqtt_client_id = format!("habanero-hub-{}", host.trim());
                }
            }
        }
        if let Some(v) = var("DB_URL") {
            self.db_url = v;
        }
        if let Some(v) = var("WEB_PORT") {
            self.web_port = v.parse().with_context(|| format!("WEB_PORT '{v}'"))?;
        }
        if let Some(v) = var("ALLOWED_ORIGINS") {
            self.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("STATIC_DIR") {
            self.static_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("DEBUG") {
            self.debug = parse_bool(&v);
        }
        if let Some(v) = var("INGEST_WORKERS") {
            self.ingest_workers = v.parse().with_context(|| format!("INGEST_WORKERS '{v}'"))?;
        }
        if let Some(v) = var("PUMP_CHANNEL") {
            self.pump_channel = v.parse().with_context(|| format!("PUMP_CHANNEL '{v}'"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Browser origins allowed by one configured entry. A full URL yields its
/// `scheme://host[:port]` origin; a bare host (optionally with a port)
/// yields both its http and https forms.
pub fn expand_origin(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    if raw.contains("://") {
        return Ok(vec![origin_of(raw)?]);
    }
    ["http", "https"]
        .iter()
        .map(|scheme| origin_of(&format!("{scheme}://{raw}")))
        .collect()
}

fn origin_of(raw: &str) -> Result<String> {
    let url = Url::parse(raw).with_context(|| format!("'{raw}' is not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("'{raw}' must use http or https");
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        bail!("'{raw}' must not carry a path, query or fragment");
    }
    Ok(url.origin().ascii_serialization())
}

impl HubConfig {
    /// Validate every field. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.mqtt_host.trim().is_empty() {
            errors.push("mqtt_host is empty".to_string());
        }
        if self.mqtt_port == 0 {
            errors.push("mqtt_port must be non-zero".to_string());
        }
        if self.mqtt_client_id.trim().is_empty() {
            errors.push("mqtt_client_id is empty".to_string());
        }
        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }
        if self.web_port == 0 {
            errors.push("web_port must be non-zero".to_string());
        }
        if !(1..=1024).contains(&self.ingest_workers) {
            errors.push(format!(
                "ingest_workers {} out of range [1, 1024]",
                self.ingest_workers
            ));
        }
        for origin in &self.allowed_origins {
            if let Err(e) = expand_origin(origin) {
                errors.push(format!("allowed origin: {e:#}"));
            }
        }

        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.external_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.external_id)
                }
            };

            if d.external_id.trim().is_empty() {
                errors.push(format!("{}: external_id is empty", ctx()));
            } else if d.external_id.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{}: external_id must not contain '/', '+' or '#'",
                    ctx()
                ));
            } else if !seen_ids.insert(&d.external_id) {
                errors.push(format!("{}: duplicate external_id", ctx()));
            }

            if d.kind.trim().is_empty() {
                errors.push(format!("{}: type is empty", ctx()));
            }
            if d.location.trim().is_empty() {
                errors.push(format!("{}: location is empty", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the defaults.
pub fn load_file(path: &Path) -> Result<HubConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(HubConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

/// File, then process environment, then validation.
pub fn load(path: &Path) -> Result<HubConfig> {
    let mut config = load_file(path)?;
    config
        .apply_env(|k| std::env::var(k).ok())
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

/// Register every seeded device. Devices that already exist are unchanged.
pub async fn apply(config: &HubConfig, db: &Db) -> Result<()> {
    for d in &config.devices {
        db.resolve_or_create(&d.external_id, &d.kind, &d.location)
            .await
            .with_context(|| format!("failed to register device '{}'", d.external_id))?;
    }

    tracing::info!(devices = config.devices.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
