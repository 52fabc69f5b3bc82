use crate::clock::format_timestamp;
use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const HEARTBEAT_TOPIC: &str = "heartbeat";
/// Where field units report local failures on the LAN broker.
pub const FIELD_ALERT_TOPIC: &str = "heartbeat_alert";
/// Remote topic for hub-raised and relayed field alerts.
pub const ALERTS_TOPIC: &str = "alerts";

pub fn status_topic(hub: &str, unit_id: &str) -> String {
    format!("{hub}/status/{unit_id}")
}

pub fn weather_topic(hub: &str) -> String {
    format!("{hub}/weather")
}

pub fn probe_topic(hub: &str) -> String {
    format!("{hub}/status/test")
}

/// Clock-sync / liveness state of a unit. The string forms are what the cloud
/// dashboards and the on-disk `camera_status` table already use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "out of sync")]
    OutOfSync,
    #[serde(rename = "DOWN")]
    Down,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Good => "good",
            SyncStatus::OutOfSync => "out of sync",
            SyncStatus::Down => "DOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "good" => Some(SyncStatus::Good),
            "out of sync" | "out_of_sync" => Some(SyncStatus::OutOfSync),
            "down" => Some(SyncStatus::Down),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat as published by a field unit on `heartbeat`.
#[derive(Debug, Deserialize)]
pub struct HeartbeatIn {
    pub name: String,
    pub timestamp: String,
    #[serde(deserialize_with = "flag_from_any")]
    pub cam_on: bool,
}

/// Decoded heartbeat handed to the heartbeat handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatEvent {
    pub unit_id: String,
    pub emitted_at: NaiveDateTime,
    pub powered_on: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitStatus {
    pub unit_id: String,
    pub last_seen: NaiveDateTime,
    pub sync_status: SyncStatus,
    pub powered_on: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRecord {
    pub id: i64,
    pub unit_id: String,
    pub receipt_time: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub fn as_i64(&self) -> i64 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }

    /// Anything other than 0 is delivered at least once.
    pub fn from_i64(level: i64) -> Self {
        if level == 0 {
            Qos::AtMostOnce
        } else {
            Qos::AtLeastOnce
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub sent: bool,
}

/// Payload of `<hub>/status/<camera>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub camera: String,
    pub last_seen: String,
    pub sync_status: SyncStatus,
    pub camera_on: bool,
}

impl StatusPayload {
    /// `last_seen` is cut to whole seconds so sub-second churn is not a change.
    pub fn from_unit(unit: &UnitStatus) -> Self {
        Self {
            camera: unit.unit_id.clone(),
            last_seen: unit.last_seen.format("%Y-%m-%dT%H:%M:%S").to_string(),
            sync_status: unit.sync_status,
            camera_on: unit.powered_on,
        }
    }
}

/// Latest weather/sensor reading, published on `<hub>/weather`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub time: String,
    #[serde(rename = "temp")]
    pub temperature: Option<f64>,
    #[serde(rename = "humid")]
    pub relative_humidity: Option<f64>,
    #[serde(rename = "pres")]
    pub pressure: Option<f64>,
    #[serde(rename = "wind")]
    pub wind_speed: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    OutOfSync,
    SyncRecovered,
    Down,
    Recovered,
}

/// Alert raised by the hub itself, published on `alerts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub hub: String,
    pub unit: String,
    pub kind: AlertKind,
    pub detail: String,
    pub timestamp: String,
}

impl Alert {
    pub fn new(hub: &str, unit: &str, kind: AlertKind, detail: String, at: &NaiveDateTime) -> Self {
        Self {
            hub: hub.to_string(),
            unit: unit.to_string(),
            kind,
            detail,
            timestamp: format_timestamp(at),
        }
    }
}

/// `cam_on` shows up as 0/1, as a bool, or as a numeric string depending on firmware.
fn flag_from_any<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(|v| v != 0.0)
            .ok_or_else(|| D::Error::custom("cam_on is not a finite number")),
        serde_json::Value::String(s) => match s.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => other
                .parse::<i64>()
                .map(|v| v != 0)
                .map_err(|_| D::Error::custom(format!("cam_on is not a flag: {other:?}"))),
        },
        other => Err(D::Error::custom(format!("cam_on is not a flag: {other}"))),
    }
}
