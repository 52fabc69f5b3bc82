//! `hive-relay` -- hub relay daemon.
//!
//! Listens for field-unit heartbeats on the LAN broker, tracks their liveness,
//! and relays status, telemetry and alerts to the cloud broker through a
//! durable outbox.
//!
//! | Variable                     | Default           | Description                     |
//! |------------------------------|-------------------|---------------------------------|
//! | `HIVE_RELAY_CONFIG`          | `hive-relay.yaml` | YAML config file                |
//! | `HIVE_RELAY_REMOTE_PASSWORD` | --                | Overrides `remote.password`     |
//! | `RUST_LOG`                   | `info`            | Log filter                      |

use hive_relay::alerts::AlertSink;
use hive_relay::clock::{SharedClock, SystemClock};
use hive_relay::config::{load_config, RelayConfig};
use hive_relay::forwarders::{StatusForwarder, TelemetryForwarder, WeatherDb};
use hive_relay::health::{LinkHealth, NetworkReporter};
use hive_relay::heartbeat::{spawn_heartbeat_consumer, HeartbeatHandler};
use hive_relay::liveness::LivenessStore;
use hive_relay::local_link::spawn_local_listener;
use hive_relay::monitor::LivenessMonitor;
use hive_relay::outbox::{Outbox, Resender};
use hive_relay::relay::RelayHandle;
use hive_relay::remote_link::RemoteLink;
use hive_relay::state::stop_channel;
use hive_relay::tasks::spawn_periodic;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_QUEUE: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn open_liveness(cfg: &RelayConfig) -> anyhow::Result<LivenessStore> {
    match LivenessStore::open(&cfg.storage.liveness_db) {
        Ok(store) => Ok(store),
        Err(e) => {
            error!(path = %cfg.storage.liveness_db, error = %e, "liveness store unavailable; running in memory");
            Ok(LivenessStore::open_in_memory()?)
        }
    }
}

fn open_outbox(cfg: &RelayConfig) -> anyhow::Result<Outbox> {
    match Outbox::open(&cfg.storage.outbox_db) {
        Ok(outbox) => Ok(outbox),
        Err(e) => {
            error!(path = %cfg.storage.outbox_db, error = %e, "outbox unavailable; messages will not survive a restart");
            Ok(Outbox::open_in_memory()?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = load_config().await;
    info!(hub = %cfg.hub.name, local = %cfg.local.host, remote = %cfg.remote.host, "starting hive-relay");

    let clock: SharedClock = Arc::new(SystemClock);
    let store = open_liveness(&cfg)?;
    let outbox = open_outbox(&cfg)?;
    let health = LinkHealth::new();
    let alerts = AlertSink::new(cfg.hub.name.clone(), outbox.clone());
    let (trigger, stop) = stop_channel();
    let th = &cfg.thresholds;
    let every = &cfg.intervals;

    let (remote, remote_task) = RemoteLink::start(&cfg.remote, cfg.hub.name.clone(), health.clone(), outbox.clone(), stop.clone())?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let relay = RelayHandle::new(
        cfg.hub.name.clone(),
        store.clone(),
        outbox.clone(),
        health.clone(),
        clock.clone(),
        th.timeout_threshold,
        events_tx.clone(),
    );

    let handler = HeartbeatHandler::new(store.clone(), alerts.clone(), clock.clone(), th.drift_threshold);
    let mut tasks = vec![
        remote_task,
        spawn_heartbeat_consumer(handler, events_rx, stop.clone()),
        spawn_local_listener(&cfg.local, events_tx, stop.clone()),
        spawn_periodic(
            LivenessMonitor::new(store.clone(), alerts, clock.clone(), th.timeout_threshold, th.startup_grace_period),
            Duration::from_secs(every.monitor_secs.max(1)),
            stop.clone(),
        ),
        spawn_periodic(
            Resender::new(outbox.clone(), Arc::new(remote)),
            Duration::from_secs(every.resend_secs.max(1)),
            stop.clone(),
        ),
        spawn_periodic(
            StatusForwarder::new(cfg.hub.name.clone(), store.clone(), outbox.clone()),
            Duration::from_secs(every.status_secs.max(1)),
            stop.clone(),
        ),
        spawn_periodic(
            TelemetryForwarder::new(cfg.hub.name.clone(), Box::new(WeatherDb::new(&cfg.storage.weather_db)), outbox.clone()),
            Duration::from_secs(every.telemetry_secs.max(1)),
            stop.clone(),
        ),
        spawn_periodic(
            NetworkReporter::new(health, store, outbox, clock, th.timeout_threshold),
            Duration::from_secs(every.network_report_secs.max(1)),
            stop,
        ),
    ];

    match relay.get_network_status() {
        Ok(status) => info!("{}", status.summary()),
        Err(e) => warn!(error = %e, "network status unavailable"),
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    trigger.stop();
    drop(relay);

    for task in tasks.drain(..) {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "task ended abnormally"),
            Err(_) => warn!("task did not stop in time"),
        }
    }
    info!("hive-relay stopped");
    Ok(())
}
