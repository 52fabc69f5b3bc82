//! Cloud uplink: TLS + credentials session to the remote broker.
//!
//! Publish-only. Nothing here decides *what* to send; the resender drains the
//! outbox through [`RemotePublisher`].

use crate::config::RemoteBrokerConf;
use crate::health::LinkHealth;
use crate::models::{probe_topic, Qos};
use crate::outbox::Outbox;
use crate::state::StopSignal;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS, Transport};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("remote broker not connected")]
    NotConnected,
    /// The client's request queue is full; the event loop has not caught up yet.
    #[error("mqtt request queue full")]
    Busy,
    #[error("mqtt client rejected request: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("failed to read CA certificate {path}: {source}")]
    CaCert {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Anything the resender can hand a stored message to.
#[async_trait]
pub trait RemotePublisher: Send + Sync {
    /// `Ok` means the client accepted the message, not that the broker acked it.
    async fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), LinkError>;
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

pub struct RemoteLink {
    client: AsyncClient,
    health: LinkHealth,
}

pub fn build_remote_options(cfg: &RemoteBrokerConf) -> Result<MqttOptions, LinkError> {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    if let Some(user) = &cfg.username {
        opts.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
    }
    let transport = match &cfg.ca_cert {
        Some(path) => {
            let ca = std::fs::read(path).map_err(|source| LinkError::CaCert { path: path.clone(), source })?;
            Transport::tls(ca, None, None)
        }
        None => Transport::tls_with_default_config(),
    };
    opts.set_transport(transport);
    Ok(opts)
}

impl RemoteLink {
    /// Builds the client and spawns its event loop. The loop keeps retrying the
    /// connection in the background until `stop` fires.
    pub fn start(
        cfg: &RemoteBrokerConf,
        hub: String,
        health: LinkHealth,
        outbox: Outbox,
        mut stop: StopSignal,
    ) -> Result<(Self, JoinHandle<()>), LinkError> {
        let opts = build_remote_options(cfg)?;
        let retry = Duration::from_secs(cfg.retry_secs.max(1));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        info!(host = %cfg.host, port = cfg.port, "remote link connecting");

        let loop_health = health.clone();
        let loop_client = client.clone();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                            loop_health.mark_connected();
                            info!("connected to remote broker");
                            enqueue_probe(&outbox, &hub);
                        }
                        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                            loop_health.mark_disconnected();
                            warn!(code = ?ack.code, "remote broker refused connection");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if loop_health.is_connected() {
                                warn!(error = %e, "remote broker connection lost");
                            } else {
                                debug!(error = %e, "remote broker unreachable");
                            }
                            loop_health.increment_reconnects();
                            tokio::select! {
                                _ = stop.stopped() => break,
                                _ = tokio::time::sleep(retry) => {}
                            }
                        }
                    }
                }
            }
            loop_health.mark_disconnected();
            let _ = loop_client.try_disconnect();
            info!("remote link stopped");
        });

        Ok((Self { client, health }, handle))
    }
}

#[async_trait]
impl RemotePublisher for RemoteLink {
    async fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), LinkError> {
        if !self.health.is_connected() {
            return Err(LinkError::NotConnected);
        }
        match self.client.try_publish(topic, qos.into(), false, payload.to_vec()) {
            Ok(()) => Ok(()),
            Err(rumqttc::ClientError::TryRequest(_)) => Err(LinkError::Busy),
            Err(e) => Err(e.into()),
        }
    }
}

/// Goes through the outbox like everything else bound for the cloud.
fn enqueue_probe(outbox: &Outbox, hub: &str) {
    let payload = serde_json::json!({
        "status": "online",
        "timestamp": chrono::Utc::now().timestamp(),
    });
    outbox.enqueue_logged(&probe_topic(hub), payload.to_string(), Qos::AtLeastOnce);
}


#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> RemoteBrokerConf {
        RemoteBrokerConf {
            username: Some("relay".into()),
            password: Some("secret".into()),
            ..RemoteBrokerConf::default()
        }
    }

    #[test]
    fn test_options_carry_credentials() {
        let opts = build_remote_options(&conf()).unwrap();
        assert_eq!(opts.credentials(), Some(("relay".to_string(), "secret".to_string())));
        assert_eq!(opts.broker_address().1, 8883);
    }

    #[test]
    fn test_missing_ca_certificate_is_reported() {
        let cfg = RemoteBrokerConf { ca_cert: Some("/nonexistent/ca.crt".into()), ..conf() };
        let err = build_remote_options(&cfg).unwrap_err();
        assert!(matches!(err, LinkError::CaCert { .. }));
    }

    #[tokio::test]
    async fn test_publish_refused_while_disconnected() {
        let (_trigger, stop) = crate::state::stop_channel();
        let outbox = Outbox::open_in_memory().unwrap();
        let cfg = RemoteBrokerConf { host: "127.0.0.1".into(), port: 1, ..conf() };
        let (link, handle) = RemoteLink::start(&cfg, "beehub".into(), LinkHealth::new(), outbox, stop).unwrap();

        let err = link.publish("beehub/weather", b"{}", Qos::AtLeastOnce).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
        handle.abort();
    }

    #[tokio::test]
    async fn test_backlog_beyond_queue_capacity_stops_the_pass() {
        let opts = build_remote_options(&conf()).unwrap();
        // event loop never polled: the request queue fills after 4 publishes
        let (client, _eventloop) = AsyncClient::new(opts, 4);
        let health = LinkHealth::new();
        health.mark_connected();
        let link = RemoteLink { client, health };

        let outbox = Outbox::open_in_memory().unwrap();
        for n in 0..20 {
            outbox.enqueue(&format!("beehub/status/hive{n}"), "{}", Qos::AtLeastOnce).unwrap();
        }
        let resender = crate::outbox::Resender::new(outbox.clone(), std::sync::Arc::new(link));
        assert_eq!(resender.resend_unsent().await.unwrap(), 4);
        assert_eq!(outbox.unsent().unwrap().len(), 16);
        // still full: nothing more goes out, and the pass ends on the first refusal
        assert_eq!(resender.resend_unsent().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_is_reported_as_busy() {
        let (client, _eventloop) = AsyncClient::new(build_remote_options(&conf()).unwrap(), 1);
        let health = LinkHealth::new();
        health.mark_connected();
        let link = RemoteLink { client, health };
        link.publish("alerts", b"a", Qos::AtLeastOnce).await.unwrap();
        let err = link.publish("alerts", b"b", Qos::AtLeastOnce).await.unwrap_err();
        assert!(matches!(err, LinkError::Busy));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(QoS::from(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(QoS::from(Qos::AtLeastOnce), QoS::AtLeastOnce);
    }
}
