use anyhow::Result;
use chrono::{Duration as ClockSkew, Local, NaiveDateTime};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::time::{sleep, Duration};

// ===== Configuration =====
const HEARTBEAT_TOPIC: &str = "heartbeat";
const FIELD_ALERT_TOPIC: &str = "heartbeat_alert";

#[derive(Debug, Clone)]
struct SimConfig {
    unit_name: String,
    hub_host: String,
    hub_port: u16,
    heartbeat_secs: u64,
    clock_skew_secs: i64,
    /// Raise a field alert every N heartbeats; 0 disables.
    alert_every: u64,
}

impl SimConfig {
    fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        Self {
            unit_name: std::env::var("UNIT_NAME").unwrap_or_else(|_| "hive1".into()),
            hub_host: std::env::var("HUB_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            hub_port: var("HUB_PORT", 1883),
            heartbeat_secs: var("HEARTBEAT_SECS", 10),
            clock_skew_secs: var("CLOCK_SKEW_SECS", 0),
            alert_every: var("ALERT_EVERY", 0),
        }
    }
}

// ===== Data Structures =====
#[derive(Debug, Serialize)]
struct Heartbeat<'a> {
    name: &'a str,
    timestamp: String,
    cam_on: u8,
}

#[derive(Debug, Serialize)]
struct FieldAlert<'a> {
    name: &'a str,
    timestamp: String,
    error: &'a str,
}

fn unit_time(skew_secs: i64) -> NaiveDateTime {
    Local::now().naive_local() + ClockSkew::seconds(skew_secs)
}

fn heartbeat_payload(cfg: &SimConfig, cam_on: bool) -> Result<Vec<u8>> {
    let hb = Heartbeat {
        name: &cfg.unit_name,
        timestamp: unit_time(cfg.clock_skew_secs).format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        cam_on: u8::from(cam_on),
    };
    Ok(serde_json::to_vec(&hb)?)
}

fn alert_payload(cfg: &SimConfig) -> Result<Vec<u8>> {
    let alert = FieldAlert {
        name: &cfg.unit_name,
        timestamp: unit_time(cfg.clock_skew_secs).format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        error: "camera_main.py is NOT running!",
    };
    Ok(serde_json::to_vec(&alert)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cfg = SimConfig::from_env();
    info!(
        "starting unit simulator {} -> {}:{} every {}s (skew {}s)",
        cfg.unit_name, cfg.hub_host, cfg.hub_port, cfg.heartbeat_secs, cfg.clock_skew_secs
    );

    let mut mqttoptions = MqttOptions::new(format!("sim-{}", cfg.unit_name), cfg.hub_host.clone(), cfg.hub_port);
    mqttoptions.set_keep_alive(Duration::from_secs(60));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let poller = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("connected to hub broker"),
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {e}. Reconnecting...");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.heartbeat_secs.max(1)));
    let mut sent: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Err(e) = publish(&client, HEARTBEAT_TOPIC, heartbeat_payload(&cfg, true)?).await {
                    error!("failed to send heartbeat: {e}");
                    continue;
                }
                sent += 1;
                debug!("heartbeat #{sent} sent");
                if cfg.alert_every > 0 && sent % cfg.alert_every == 0 {
                    if let Err(e) = publish(&client, FIELD_ALERT_TOPIC, alert_payload(&cfg)?).await {
                        error!("failed to send alert: {e}");
                    }
                }
            }
        }
    }

    info!("stopping: sending final cam_on=0 heartbeat");
    if let Err(e) = publish(&client, HEARTBEAT_TOPIC, heartbeat_payload(&cfg, false)?).await {
        error!("failed to send final offline heartbeat: {e}");
    }
    // let the event loop flush the last publish
    sleep(Duration::from_millis(500)).await;
    client.disconnect().await.ok();
    poller.abort();
    Ok(())
}

async fn publish(client: &AsyncClient, topic: &str, payload: Vec<u8>) -> Result<()> {
    client.publish(topic, QoS::AtMostOnce, false, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(skew: i64) -> SimConfig {
        SimConfig {
            unit_name: "hive4".into(),
            hub_host: "127.0.0.1".into(),
            hub_port: 1883,
            heartbeat_secs: 10,
            clock_skew_secs: skew,
            alert_every: 0,
        }
    }

    #[test]
    fn test_heartbeat_shape() {
        let raw = heartbeat_payload(&cfg(0), false).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(v["name"], "hive4");
        assert_eq!(v["cam_on"], 0);
        let ts = v["timestamp"].as_str().unwrap();
        assert!(NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").is_ok());
    }

    #[test]
    fn test_clock_skew_is_applied() {
        let skewed = unit_time(120);
        let drift = (skewed - Local::now().naive_local()).num_seconds();
        assert!((119..=120).contains(&drift));
    }

    #[test]
    fn test_alert_shape() {
        let v: serde_json::Value = serde_json::from_slice(&alert_payload(&cfg(0)).unwrap()).unwrap();
        assert_eq!(v["name"], "hive4");
        assert!(v["error"].as_str().unwrap().contains("NOT running"));
    }
}
