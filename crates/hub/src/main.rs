mod actuation;
mod config;
mod db;
mod error;
mod ingest;
mod mqtt;
mod query;
mod state;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use actuation::ActuationService;
use db::Db;
use ingest::Ingestor;
use mqtt::STATUS_SUBSCRIPTION;
use query::QueryService;
use state::{HubStatus, SharedStatus};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    // RUST_LOG wins; otherwise start at info and raise to debug once the
    // config says so.
    let rust_log = EnvFilter::try_from_default_env().ok();
    let explicit_filter = rust_log.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(rust_log.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hub.toml".to_string());
    let cfg = config::load(&PathBuf::from(&config_path))?;
    if cfg.debug && !explicit_filter {
        filter_handle
            .reload(EnvFilter::new("debug"))
            .context("failed to raise log level")?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mqtt_host = %cfg.mqtt_host,
        mqtt_port = cfg.mqtt_port,
        web_port = cfg.web_port,
        origins = ?cfg.allowed_origins,
        "starting habanero hub"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    // ── Shared status (ephemeral, for /api/status) ──────────────────
    let status = HubStatus::shared();
    status.write().await.record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt_client_id, &cfg.mqtt_host, cfg.mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        query: QueryService::new(db.clone()),
        actuation: ActuationService::new(
            db.clone(),
            Arc::new(client.clone()),
            status.clone(),
            cfg.pump_channel,
        ),
        status: status.clone(),
    };
    let app = web::app(app_state, &cfg.allowed_origins, cfg.static_dir.clone());
    let listener = web::bind(cfg.web_port).await?;

    // ── Ingestion loop ──────────────────────────────────────────────
    let ingestor = Ingestor::new(db.clone(), status.clone(), cfg.ingest_workers);

    // The hub is useless without its API, so a server failure ends it.
    tokio::select! {
        res = web::serve(listener, app) => res.context("api server stopped"),
        () = run_mqtt(eventloop, client, ingestor, status) => Ok(()),
    }
}

async fn run_mqtt(
    mut eventloop: EventLoop,
    client: AsyncClient,
    ingestor: Ingestor,
    status: SharedStatus,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                ingestor.dispatch(p.topic, p.payload.to_vec()).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Re-subscribe on every (re)connect; try_ keeps the loop
                // from waiting on its own request queue.
                if let Err(e) = client.try_subscribe(STATUS_SUBSCRIPTION, QoS::AtLeastOnce) {
                    error!("subscribe to {STATUS_SUBSCRIPTION} failed: {e}");
                }
                let mut st = status.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                info!(topic = STATUS_SUBSCRIPTION, "subscribed");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");

                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
