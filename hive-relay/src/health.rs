use crate::clock::{format_timestamp, seconds_between, SharedClock};
use crate::liveness::LivenessStore;
use crate::models::SyncStatus;
use crate::outbox::Outbox;
use crate::store::StoreError;
use crate::tasks::PeriodicTask;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Connection state of the cellular uplink, written by the remote link's
/// event loop and read by the resender and the display.
#[derive(Clone)]
pub struct LinkHealth {
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU32>,
    status: Arc<Mutex<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub status: String,
    pub reconnects: u32,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            reconnects: Arc::new(AtomicU32::new(0)),
            status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        *self.status.lock() = "connected".to_string();
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        *self.status.lock() = "reconnecting".to_string();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            status: self.status.lock().clone(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// What the display collaborator shows: uplink state and units heard recently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkStatus {
    pub cell_connected: bool,
    pub active_local_units: Vec<String>,
}

impl NetworkStatus {
    pub fn summary(&self) -> String {
        let cell = if self.cell_connected { "Connected" } else { "Down" };
        let units = if self.active_local_units.is_empty() {
            "none".to_string()
        } else {
            self.active_local_units.join(", ")
        };
        format!("Cell: {cell} | Units: {units}")
    }
}

/// A unit is active when it is not DOWN and was heard within `timeout_secs`.
pub fn network_status(
    health: &LinkHealth,
    store: &LivenessStore,
    clock: &SharedClock,
    timeout_secs: f64,
) -> Result<NetworkStatus, StoreError> {
    let now = clock.now();
    let active_local_units = store
        .list_units()?
        .into_iter()
        .filter(|u| u.sync_status != SyncStatus::Down && seconds_between(now, u.last_seen) <= timeout_secs)
        .map(|u| u.unit_id)
        .collect();
    Ok(NetworkStatus {
        cell_connected: health.is_connected(),
        active_local_units,
    })
}

/// Periodically logs the network summary; louder when it changes.
pub struct NetworkReporter {
    health: LinkHealth,
    store: LivenessStore,
    outbox: Outbox,
    clock: SharedClock,
    timeout_secs: f64,
    last: Option<NetworkStatus>,
}

impl NetworkReporter {
    pub fn new(health: LinkHealth, store: LivenessStore, outbox: Outbox, clock: SharedClock, timeout_secs: f64) -> Self {
        Self { health, store, outbox, clock, timeout_secs, last: None }
    }
}

#[async_trait]
impl PeriodicTask for NetworkReporter {
    fn name(&self) -> &'static str {
        "network-reporter"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let status = network_status(&self.health, &self.store, &self.clock, self.timeout_secs)?;
        let stats = self.outbox.stats()?;
        let link = self.health.snapshot();
        if self.last.as_ref() != Some(&status) {
            info!(pending = stats.pending, sent = stats.sent, link = %link.status, "{}", status.summary());
            for unit in &status.active_local_units {
                log_unit_history(&self.store, unit)?;
            }
            self.last = Some(status);
        } else {
            debug!(pending = stats.pending, reconnects = link.reconnects, "{}", status.summary());
        }
        Ok(())
    }
}

fn log_unit_history(store: &LivenessStore, unit: &str) -> Result<(), StoreError> {
    let heartbeats = store.heartbeat_count(unit)?;
    let last = store.recent_heartbeats(unit, 1)?;
    let last_receipt = last.first().map(|r| format_timestamp(&r.receipt_time)).unwrap_or_default();
    debug!(unit, heartbeats, %last_receipt, "unit history");
    Ok(())
}
