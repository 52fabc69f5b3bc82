//! Status and telemetry forwarders: the two periodic producers that feed the outbox.

use crate::liveness::LivenessStore;
use crate::models::{status_topic, weather_topic, Qos, SensorSnapshot, StatusPayload, SyncStatus};
use crate::outbox::Outbox;
use crate::store::StoreError;
use crate::tasks::PeriodicTask;
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

pub fn enqueue_status(outbox: &Outbox, hub: &str, payload: &StatusPayload) -> Result<i64, StoreError> {
    let body = serde_json::to_vec(payload)?;
    outbox.enqueue(&status_topic(hub, &payload.camera), body, Qos::AtLeastOnce)
}

pub fn enqueue_snapshot(outbox: &Outbox, hub: &str, snapshot: &SensorSnapshot) -> Result<i64, StoreError> {
    let body = serde_json::to_vec(snapshot)?;
    outbox.enqueue(&weather_topic(hub), body, Qos::AtLeastOnce)
}

type StatusKey = (String, SyncStatus, bool);

/// Forwards a unit's status only when `(last_seen, sync_status, powered_on)` changed.
pub struct StatusForwarder {
    hub: String,
    store: LivenessStore,
    outbox: Outbox,
    last_seen_cache: HashMap<String, StatusKey>,
}

impl StatusForwarder {
    pub fn new(hub: impl Into<String>, store: LivenessStore, outbox: Outbox) -> Self {
        Self {
            hub: hub.into(),
            store,
            outbox,
            last_seen_cache: HashMap::new(),
        }
    }

    /// Returns how many status messages were enqueued.
    pub fn forward_changes(&mut self) -> Result<usize, StoreError> {
        let mut enqueued = 0;
        for unit in self.store.list_units()? {
            let payload = StatusPayload::from_unit(&unit);
            let key = (payload.last_seen.clone(), payload.sync_status, payload.camera_on);
            if self.last_seen_cache.get(&unit.unit_id) == Some(&key) {
                continue;
            }
            match enqueue_status(&self.outbox, &self.hub, &payload) {
                Ok(_) => {
                    debug!(unit = %unit.unit_id, status = %payload.sync_status, "status change queued");
                    self.last_seen_cache.insert(unit.unit_id, key);
                    enqueued += 1;
                }
                // cache untouched, so the change is retried next cycle
                Err(e) => warn!(unit = %unit.unit_id, error = %e, "could not queue status"),
            }
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl PeriodicTask for StatusForwarder {
    fn name(&self) -> &'static str {
        "status-forwarder"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.forward_changes()?;
        Ok(())
    }
}

/// Latest sensor reading, owned by the sensor logger.
pub trait SnapshotSource: Send {
    fn latest(&self) -> Result<Option<SensorSnapshot>, StoreError>;
}

/// Reads the newest row of the sensor logger's `weather_data` table.
pub struct WeatherDb {
    path: PathBuf,
}

impl WeatherDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for WeatherDb {
    fn latest(&self) -> Result<Option<SensorSnapshot>, StoreError> {
        // opened per read: the file belongs to another process and may not exist yet
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let row = conn
            .query_row(
                "SELECT time, temperature, relative_humidity, pressure, wind_speed
                 FROM weather_data ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(SensorSnapshot {
                        time: row.get(0)?,
                        temperature: row.get(1)?,
                        relative_humidity: row.get(2)?,
                        pressure: row.get(3)?,
                        wind_speed: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

/// Sends the single newest snapshot every cycle, unconditionally. Readings
/// superseded between cycles are never relayed.
pub struct TelemetryForwarder {
    hub: String,
    source: Box<dyn SnapshotSource>,
    outbox: Outbox,
}

impl TelemetryForwarder {
    pub fn new(hub: impl Into<String>, source: Box<dyn SnapshotSource>, outbox: Outbox) -> Self {
        Self { hub: hub.into(), source, outbox }
    }

    pub fn forward_latest(&self) -> Result<Option<i64>, StoreError> {
        match self.source.latest()? {
            Some(snapshot) => enqueue_snapshot(&self.outbox, &self.hub, &snapshot).map(Some),
            None => {
                debug!("no sensor snapshot yet");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for TelemetryForwarder {
    fn name(&self) -> &'static str {
        "telemetry-forwarder"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.forward_latest()?;
        Ok(())
    }
}
