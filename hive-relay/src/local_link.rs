//! LAN side: plain-TCP session to the site broker, subscribed to `heartbeat`,
//! `alerts` and the field units' `heartbeat_alert`. Messages published while disconnected are simply missed;
//! heartbeats are periodic so the next one heals the gap.

use crate::config::LocalBrokerConf;
use crate::models::{HeartbeatEvent, ALERTS_TOPIC, FIELD_ALERT_TOPIC, HEARTBEAT_TOPIC};
use crate::state::StopSignal;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum LocalEvent {
    /// Raw `heartbeat` payload, decoded by the handler.
    Heartbeat(Vec<u8>),
    /// Heartbeat handed over already decoded (collaborator entry point).
    Decoded(HeartbeatEvent),
    /// Raw `alerts`/`heartbeat_alert` payload from a field unit.
    FieldAlert(Vec<u8>),
}

pub fn route_message(topic: &str, payload: &[u8]) -> Option<LocalEvent> {
    match topic {
        HEARTBEAT_TOPIC => Some(LocalEvent::Heartbeat(payload.to_vec())),
        ALERTS_TOPIC | FIELD_ALERT_TOPIC => Some(LocalEvent::FieldAlert(payload.to_vec())),
        _ => None,
    }
}

pub fn build_local_options(cfg: &LocalBrokerConf) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts
}

pub fn spawn_local_listener(cfg: &LocalBrokerConf, events: mpsc::Sender<LocalEvent>, mut stop: StopSignal) -> JoinHandle<()> {
    let opts = build_local_options(cfg);
    let retry = Duration::from_secs(cfg.retry_secs.max(1));
    let host = cfg.host.clone();

    task::spawn(async move {
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        info!(%host, "local link connecting");

        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("connected to local broker");
                        // clean session: subscriptions must be renewed on every connect
                        for topic in [HEARTBEAT_TOPIC, ALERTS_TOPIC, FIELD_ALERT_TOPIC] {
                            if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                                warn!(topic, error = %e, "subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let Some(event) = route_message(&p.topic, &p.payload) else {
                            debug!(topic = %p.topic, "ignoring message on unexpected topic");
                            continue;
                        };
                        if let Err(e) = events.try_send(event) {
                            warn!(topic = %p.topic, error = %e, "heartbeat queue full; message dropped");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "local broker error; reconnecting");
                        tokio::select! {
                            _ = stop.stopped() => break,
                            _ = tokio::time::sleep(retry) => {}
                        }
                    }
                }
            }
        }

        let _ = client.try_disconnect();
        info!("local link stopped");
    })
}
