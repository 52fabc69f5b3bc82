/*!
Mock MQTT client for testing the uplink without a broker.

Records every accepted publish. A reachability switch simulates the cellular
link going away: while unreachable, publishes fail and nothing is recorded.
*/

use anyhow::Result;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Stands in for `rumqttc::AsyncClient` on the publishing side.
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    reachable: Arc<AtomicBool>,
    rejected: Arc<Mutex<usize>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            reachable: Arc::new(AtomicBool::new(true)),
            rejected: Arc::new(Mutex::new(0)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        log::info!("[mock] broker {}", if reachable { "reachable" } else { "unreachable" });
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Same shape as `AsyncClient::publish`.
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if !self.is_reachable() {
            *self.rejected.lock().unwrap() += 1;
            log::debug!("[mock] publish to {topic} rejected: broker unreachable");
            anyhow::bail!("broker unreachable");
        }

        let message = MockMessage { topic, payload: payload.into(), qos, retain };
        log::info!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Publishes refused while the broker was unreachable.
    pub fn rejected_count(&self) -> usize {
        *self.rejected.lock().unwrap()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message on `topic` as JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        *self.rejected.lock().unwrap() = 0;
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}
