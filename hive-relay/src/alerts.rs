use crate::models::{Alert, AlertKind, Qos, ALERTS_TOPIC};
use crate::outbox::Outbox;
use chrono::NaiveDateTime;
use tracing::{info, warn};

/// Where liveness transitions end up: the log, and the `alerts` topic via the outbox.
#[derive(Clone)]
pub struct AlertSink {
    hub: String,
    outbox: Outbox,
}

impl AlertSink {
    pub fn new(hub: impl Into<String>, outbox: Outbox) -> Self {
        Self { hub: hub.into(), outbox }
    }

    pub fn emit(&self, unit: &str, kind: AlertKind, detail: String, at: &NaiveDateTime) {
        match kind {
            AlertKind::OutOfSync | AlertKind::Down => warn!(unit, ?kind, "{detail}"),
            AlertKind::SyncRecovered | AlertKind::Recovered => info!(unit, ?kind, "{detail}"),
        }
        let alert = Alert::new(&self.hub, unit, kind, detail, at);
        match serde_json::to_vec(&alert) {
            Ok(payload) => {
                self.outbox.enqueue_logged(ALERTS_TOPIC, payload, Qos::AtLeastOnce);
            }
            Err(e) => warn!(unit, error = %e, "could not encode alert"),
        }
    }

    /// Alerts raised by field units on the LAN go up verbatim.
    pub fn relay_field_alert(&self, payload: &[u8]) {
        warn!(payload = %String::from_utf8_lossy(payload), "field unit alert");
        self.outbox.enqueue_logged(ALERTS_TOPIC, payload.to_vec(), Qos::AtLeastOnce);
    }
}

#[cfg(test)]
pub fn alerts_of_kind(outbox: &Outbox, kind: AlertKind) -> Vec<Alert> {
    outbox
        .unsent()
        .unwrap()
        .into_iter()
        .filter(|m| m.topic == ALERTS_TOPIC)
        .filter_map(|m| serde_json::from_slice::<Alert>(&m.payload).ok())
        .filter(|a| a.kind == kind)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ts;
    use hive_devkit::FieldAlertBuilder;

    #[test]
    fn test_emit_enqueues_json_alert() {
        let outbox = Outbox::open_in_memory().unwrap();
        let sink = AlertSink::new("beehub", outbox.clone());
        sink.emit("hive3", AlertKind::Down, "hive3 is DOWN".into(), &ts("2024-01-01T00:01:40"));

        let down = alerts_of_kind(&outbox, AlertKind::Down);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].hub, "beehub");
        assert_eq!(down[0].unit, "hive3");
        assert_eq!(down[0].timestamp, "2024-01-01T00:01:40");
    }

    #[test]
    fn test_field_alert_is_relayed_verbatim() {
        let outbox = Outbox::open_in_memory().unwrap();
        let sink = AlertSink::new("beehub", outbox.clone());
        let raw = FieldAlertBuilder::new("hive2", "camera_main.py is NOT running!").to_bytes();
        sink.relay_field_alert(&raw);

        let unsent = outbox.unsent().unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].topic, "alerts");
        assert_eq!(unsent[0].payload, raw);
    }
}
