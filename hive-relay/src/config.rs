use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "HIVE_RELAY_CONFIG";
pub const REMOTE_PASSWORD_ENV: &str = "HIVE_RELAY_REMOTE_PASSWORD";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub hub: HubConf,
    pub local: LocalBrokerConf,
    pub remote: RemoteBrokerConf,
    pub storage: StorageConf,
    pub thresholds: Thresholds,
    pub intervals: Intervals,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConf {
    /// Prefix of every per-hub remote topic.
    pub name: String,
}

impl Default for HubConf {
    fn default() -> Self {
        Self { name: "beehub".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LocalBrokerConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub retry_secs: u64,
}

impl Default for LocalBrokerConf {
    fn default() -> Self {
        Self {
            host: "192.168.2.1".into(),
            port: 1883,
            client_id: "hive-relay-local".into(),
            keep_alive_secs: 60,
            retry_secs: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteBrokerConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM bundle to trust instead of the platform roots.
    pub ca_cert: Option<String>,
    pub keep_alive_secs: u64,
    pub retry_secs: u64,
}

impl Default for RemoteBrokerConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8883,
            client_id: "hive-relay-remote".into(),
            username: None,
            password: None,
            ca_cert: None,
            keep_alive_secs: 60,
            retry_secs: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub liveness_db: String,
    pub outbox_db: String,
    /// Written by the sensor logger; only ever read here.
    pub weather_db: String,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self {
            liveness_db: "data/heartbeat.db".into(),
            outbox_db: "data/outbox.db".into(),
            weather_db: "data/weather.db".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Thresholds {
    pub timeout_threshold: f64,
    pub drift_threshold: f64,
    pub startup_grace_period: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            timeout_threshold: 90.0,
            drift_threshold: 30.0,
            startup_grace_period: 120.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Intervals {
    pub monitor_secs: u64,
    pub resend_secs: u64,
    pub status_secs: u64,
    pub telemetry_secs: u64,
    pub network_report_secs: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            monitor_secs: 10,
            resend_secs: 1,
            status_secs: 60,
            telemetry_secs: 60,
            network_report_secs: 30,
        }
    }
}

pub fn parse_config(txt: &str) -> Result<RelayConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(RelayConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Secrets stay out of the YAML when the environment provides them.
pub fn apply_env_overrides(cfg: &mut RelayConfig, password: Option<String>) {
    if let Some(pw) = password.filter(|p| !p.is_empty()) {
        cfg.remote.password = Some(pw);
    }
}

pub async fn load_config() -> RelayConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "hive-relay.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match fs::read_to_string(&path).await {
            Ok(txt) => parse_config(&txt).unwrap_or_else(|e| {
                warn!(%path, error = %e, "invalid config; using defaults");
                RelayConfig::default()
            }),
            Err(e) => {
                warn!(%path, error = %e, "unreadable config; using defaults");
                RelayConfig::default()
            }
        }
    } else {
        info!(%path, "no config file; using defaults");
        RelayConfig::default()
    };
    apply_env_overrides(&mut cfg, std::env::var(REMOTE_PASSWORD_ENV).ok());
    cfg
}
