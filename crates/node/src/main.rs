mod sim;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Scenario, SoilMoistureSim};

/// Commands shorter than this are ignored by the pump driver.
const MIN_PUMP_MS: u64 = 50;
/// Commands longer than this are clamped.
const MAX_PUMP_MS: u64 = 60_000;

#[derive(Debug, PartialEq, Eq)]
struct PumpCommand {
    pump_id: String,
    duration: Duration,
}

/// Parse "habanero-controls/<device>/pump/<n>" with a decimal-ms payload.
/// `Ok(None)` means a valid command too short to act on.
fn parse_pump_command(topic: &str, device_id: &str, payload: &[u8]) -> Result<Option<PumpCommand>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != "habanero-controls" || parts[1] != device_id {
        bail!("unexpected command topic '{topic}'");
    }
    if parts[2] != "pump" {
        bail!("unsupported command '{}'", parts[2]);
    }

    let text = String::from_utf8_lossy(payload);
    let ms: u64 = text
        .trim()
        .parse()
        .with_context(|| format!("bad pump duration '{}'", text.trim()))?;
    if ms < MIN_PUMP_MS {
        return Ok(None);
    }

    Ok(Some(PumpCommand {
        pump_id: parts[3].to_string(),
        duration: Duration::from_millis(ms.min(MAX_PUMP_MS)),
    }))
}

fn status_topic(device_id: &str) -> String {
    format!("habanero-status/{device_id}/soil-moisture")
}

fn command_subscription(device_id: &str) -> String {
    format!("habanero-controls/{device_id}/+/+")
}

fn random_device_id() -> String {
    format!("{:016x}", fastrand::u64(..))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| random_device_id());
    let publish_every_s: u64 = env::var("PUBLISH_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut mqttoptions = MqttOptions::new(format!("habanero-node-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // The event loop task owns inbound commands and forwards pump requests.
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<PumpCommand>(8);
    let sub_client = client.clone();
    let subscription = command_subscription(&device_id);
    let loop_device_id = device_id.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(&subscription, QoS::AtLeastOnce) {
                        warn!("subscribe to {subscription} failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match parse_pump_command(&p.topic, &loop_device_id, &p.payload) {
                        Ok(Some(cmd)) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => info!(topic = %p.topic, "pump command too short, ignored"),
                        Err(e) => warn!("{e:#}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = status_topic(&device_id);
    info!(%topic, %scenario, every_s = publish_every_s, "publishing");

    let mut sim = SoilMoistureSim::new(scenario);
    let mut ticker = tokio::time::interval(Duration::from_secs(publish_every_s.max(1)));
    let mut pump_until: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pumping = pump_until.is_some_and(|t| Instant::now() < t);
                if !pumping && pump_until.take().is_some() {
                    info!("pump shutoff");
                }
                sim.set_pumping(pumping);

                let moisture = sim.sample();
                let payload = format!("{moisture:.1}");
                match client.publish(&topic, QoS::AtLeastOnce, false, payload.clone()).await {
                    Ok(()) => info!(moisture = %payload, "published reading"),
                    Err(e) => warn!("publish error: {e}"),
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                info!(
                    pump = %cmd.pump_id,
                    duration_ms = cmd.duration.as_millis() as u64,
                    "activating pump"
                );
                pump_until = Some(Instant::now() + cmd.duration);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_command_valid() {
        let cmd = parse_pump_command("habanero-controls/dev1/pump/3", "dev1", b"1500")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.pump_id, "3");
        assert_eq!(cmd.duration, Duration::from_millis(1500));
    }

    #[test]
    fn pump_command_clamped_to_max() {
        let cmd = parse_pump_command("habanero-controls/dev1/pump/1", "dev1", b"90000")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.duration, Duration::from_millis(MAX_PUMP_MS));
    }

    #[test]
    fn pump_command_too_short_ignored() {
        assert!(parse_pump_command("habanero-controls/dev1/pump/1", "dev1", b"49")
            .unwrap()
            .is_none());
    }

    #[test]
    fn pump_command_other_device_rejected() {
        assert!(parse_pump_command("habanero-controls/dev2/pump/1", "dev1", b"1000").is_err());
    }

    #[test]
    fn pump_command_wrong_shape_rejected() {
        assert!(parse_pump_command("habanero-controls/dev1/pump", "dev1", b"1000").is_err());
        assert!(parse_pump_command("habanero-controls/dev1/led/1", "dev1", b"ON").is_err());
    }

    #[test]
    fn pump_command_bad_payload_rejected() {
        let err = parse_pump_command("habanero-controls/dev1/pump/3", "dev1", b"soon").unwrap_err();
        assert!(format!("{err:#}").contains("bad pump duration 'soon'"));
        assert!(parse_pump_command("habanero-controls/dev1/pump/3", "dev1", b"-5").is_err());
    }

    #[test]
    fn topics_match_hub_layout() {
        assert_eq!(status_topic("dev1"), "habanero-status/dev1/soil-moisture");
        assert_eq!(command_subscription("dev1"), "habanero-controls/dev1/+/+");
    }

    #[test]
    fn random_device_id_is_hex() {
        let id = random_device_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
