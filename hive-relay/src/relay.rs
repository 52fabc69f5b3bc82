//! Handle given to the hub's other subsystems (display, sensor logger).

use crate::clock::SharedClock;
use crate::forwarders::{enqueue_snapshot, enqueue_status};
use crate::health::{network_status, LinkHealth, NetworkStatus};
use crate::liveness::LivenessStore;
use crate::local_link::LocalEvent;
use crate::models::{HeartbeatEvent, SensorSnapshot, StatusPayload};
use crate::outbox::Outbox;
use crate::store::StoreError;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Clone)]
pub struct RelayHandle {
    hub: String,
    store: LivenessStore,
    outbox: Outbox,
    health: LinkHealth,
    clock: SharedClock,
    timeout_secs: f64,
    events: mpsc::Sender<LocalEvent>,
}

impl RelayHandle {
    pub fn new(
        hub: impl Into<String>,
        store: LivenessStore,
        outbox: Outbox,
        health: LinkHealth,
        clock: SharedClock,
        timeout_secs: f64,
        events: mpsc::Sender<LocalEvent>,
    ) -> Self {
        Self { hub: hub.into(), store, outbox, health, clock, timeout_secs, events }
    }

    /// Queues the unit's current status regardless of the forwarder's cache.
    /// `Ok(None)` when the unit has never been heard from.
    pub fn enqueue_status_change(&self, unit_id: &str) -> Result<Option<i64>, StoreError> {
        match self.store.unit(unit_id)? {
            Some(unit) => enqueue_status(&self.outbox, &self.hub, &StatusPayload::from_unit(&unit)).map(Some),
            None => Ok(None),
        }
    }

    pub fn enqueue_sensor_snapshot(&self, snapshot: &SensorSnapshot) -> Result<i64, StoreError> {
        enqueue_snapshot(&self.outbox, &self.hub, snapshot)
    }

    pub fn get_network_status(&self) -> Result<NetworkStatus, StoreError> {
        network_status(&self.health, &self.store, &self.clock, self.timeout_secs)
    }

    /// Hands a decoded heartbeat to the handler task. Returns false if it was dropped.
    pub fn on_heartbeat(&self, event: HeartbeatEvent) -> bool {
        match self.events.try_send(LocalEvent::Decoded(event)) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "heartbeat queue unavailable; event dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ts, ManualClock};
    use crate::models::SyncStatus;

    fn handle(events: mpsc::Sender<LocalEvent>) -> (RelayHandle, LivenessStore, Outbox) {
        let store = LivenessStore::open_in_memory().unwrap();
        let outbox = Outbox::open_in_memory().unwrap();
        let relay = RelayHandle::new(
            "beehub",
            store.clone(),
            outbox.clone(),
            LinkHealth::new(),
            ManualClock::starting_at("2024-01-01T00:01:00"),
            90.0,
            events,
        );
        (relay, store, outbox)
    }

    #[test]
    fn test_enqueue_status_change() {
        let (tx, _rx) = mpsc::channel(1);
        let (relay, store, outbox) = handle(tx);
        assert_eq!(relay.enqueue_status_change("hive9").unwrap(), None);

        store.record_heartbeat("hive1", &ts("2024-01-01T00:00:30.250"), SyncStatus::Good, true).unwrap();
        assert!(relay.enqueue_status_change("hive1").unwrap().is_some());

        let msg = &outbox.unsent().unwrap()[0];
        assert_eq!(msg.topic, "beehub/status/hive1");
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["camera"], "hive1");
        assert_eq!(body["last_seen"], "2024-01-01T00:00:30");
        assert_eq!(body["sync_status"], "good");
        assert_eq!(body["camera_on"], true);
    }

    #[test]
    fn test_enqueue_sensor_snapshot() {
        let (tx, _rx) = mpsc::channel(1);
        let (relay, _, outbox) = handle(tx);
        let snapshot = SensorSnapshot {
            time: "2024-01-01T00:00:00".into(),
            temperature: Some(21.0),
            relative_humidity: None,
            pressure: None,
            wind_speed: None,
        };
        relay.enqueue_sensor_snapshot(&snapshot).unwrap();
        assert_eq!(outbox.unsent().unwrap()[0].topic, "beehub/weather");
    }

    #[test]
    fn test_network_status_and_heartbeat_handoff() {
        let (tx, mut rx) = mpsc::channel(1);
        let (relay, store, _) = handle(tx);
        store.record_heartbeat("hive1", &ts("2024-01-01T00:00:50"), SyncStatus::Good, true).unwrap();

        let status = relay.get_network_status().unwrap();
        assert!(!status.cell_connected);
        assert_eq!(status.active_local_units, vec!["hive1"]);

        let event = HeartbeatEvent { unit_id: "hive1".into(), emitted_at: ts("2024-01-01T00:01:00"), powered_on: true };
        assert!(relay.on_heartbeat(event.clone()));
        // capacity 1: the second one is dropped, not blocked on
        assert!(!relay.on_heartbeat(event));
        assert!(matches!(rx.try_recv(), Ok(LocalEvent::Decoded(e)) if e.unit_id == "hive1"));
    }
}
