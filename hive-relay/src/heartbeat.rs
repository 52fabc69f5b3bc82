//! Heartbeat handler: drift detection, liveness store update and edge-triggered
//! sync alerts for every heartbeat coming off the LAN.

use crate::alerts::AlertSink;
use crate::clock::{parse_timestamp, seconds_between, SharedClock};
use crate::liveness::LivenessStore;
use crate::local_link::LocalEvent;
use crate::models::{AlertKind, HeartbeatEvent, HeartbeatIn, SyncStatus};
use crate::state::StopSignal;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("invalid heartbeat JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unparseable heartbeat timestamp: {0:?}")]
    Timestamp(String),
}

pub fn decode_heartbeat(payload: &[u8]) -> Result<HeartbeatEvent, HeartbeatError> {
    let raw: HeartbeatIn = serde_json::from_slice(payload)?;
    let emitted_at = parse_timestamp(&raw.timestamp).ok_or(HeartbeatError::Timestamp(raw.timestamp))?;
    Ok(HeartbeatEvent {
        unit_id: raw.name,
        emitted_at,
        powered_on: raw.cam_on,
    })
}

pub fn classify_drift(drift_secs: f64, drift_threshold_secs: f64) -> SyncStatus {
    if drift_secs <= drift_threshold_secs {
        SyncStatus::Good
    } else {
        SyncStatus::OutOfSync
    }
}

pub struct HeartbeatHandler {
    store: LivenessStore,
    alerts: AlertSink,
    clock: SharedClock,
    drift_threshold_secs: f64,
    /// Last sync status this handler saw per unit; only used to fire alerts on edges.
    warning_state: HashMap<String, SyncStatus>,
}

impl HeartbeatHandler {
    pub fn new(store: LivenessStore, alerts: AlertSink, clock: SharedClock, drift_threshold_secs: f64) -> Self {
        Self {
            store,
            alerts,
            clock,
            drift_threshold_secs,
            warning_state: HashMap::new(),
        }
    }

    /// Decodes and applies a raw `heartbeat` payload. Malformed input is logged and dropped.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Option<SyncStatus> {
        match decode_heartbeat(payload) {
            Ok(event) => self.on_heartbeat(event),
            Err(e) => {
                warn!(error = %e, payload = %String::from_utf8_lossy(payload), "dropping malformed heartbeat");
                None
            }
        }
    }

    /// Returns the recorded sync status, or `None` if the store rejected the write.
    pub fn on_heartbeat(&mut self, event: HeartbeatEvent) -> Option<SyncStatus> {
        let now = self.clock.now();
        let drift = seconds_between(now, event.emitted_at).abs();
        let status = classify_drift(drift, self.drift_threshold_secs);
        debug!(unit = %event.unit_id, drift_secs = drift, %status, cam_on = event.powered_on, "heartbeat");

        if let Err(e) = self.store.record_heartbeat(&event.unit_id, &now, status, event.powered_on) {
            warn!(unit = %event.unit_id, error = %e, "could not record heartbeat");
            return None;
        }

        let previous = self.warning_state.insert(event.unit_id.clone(), status);
        match (previous, status) {
            (Some(SyncStatus::OutOfSync), SyncStatus::OutOfSync) => {}
            (_, SyncStatus::OutOfSync) => self.alerts.emit(
                &event.unit_id,
                AlertKind::OutOfSync,
                format!("{} clock out of sync by {drift:.2}s", event.unit_id),
                &now,
            ),
            (Some(SyncStatus::OutOfSync), SyncStatus::Good) => self.alerts.emit(
                &event.unit_id,
                AlertKind::SyncRecovered,
                format!("{} has recovered from sync issue", event.unit_id),
                &now,
            ),
            _ => {}
        }
        Some(status)
    }

    fn handle_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Heartbeat(payload) => {
                self.handle_payload(&payload);
            }
            LocalEvent::Decoded(event) => {
                self.on_heartbeat(event);
            }
            LocalEvent::FieldAlert(payload) => self.alerts.relay_field_alert(&payload),
        }
    }
}

/// Owns the handler (and so its warning state) on a single task; one bad
/// message never ends the loop.
pub fn spawn_heartbeat_consumer(
    mut handler: HeartbeatHandler,
    mut events: mpsc::Receiver<LocalEvent>,
    mut stop: StopSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("heartbeat consumer started");
        loop {
            let event = tokio::select! {
                _ = stop.stopped() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))).is_err() {
                error!("heartbeat handling panicked; message dropped");
            }
        }
        info!("heartbeat consumer stopped");
    })
}
