//! Durable outbox and its resender.
//!
//! Everything bound for the cloud is written here first. The resender is the
//! only writer of `sent`, and only flips it after the client accepted the
//! publish, which makes delivery at-least-once: a crash between the publish
//! and the commit replays the message on the next start.

use crate::models::{OutboxMessage, Qos};
use crate::remote_link::{LinkError, RemotePublisher};
use crate::state::{new_state, Shared};
use crate::store::{open_database, open_in_memory, StoreError};
use crate::tasks::PeriodicTask;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        payload BLOB NOT NULL,
        qos INTEGER NOT NULL DEFAULT 1,
        sent INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_messages_unsent ON messages (sent, id);
";

#[derive(Clone)]
pub struct Outbox {
    conn: Shared<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub sent: u64,
}

impl Outbox {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self { conn: new_state(open_database(path, SCHEMA)?) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self { conn: new_state(open_in_memory(SCHEMA)?) })
    }

    /// Appends an unsent message and returns its id.
    pub fn enqueue<P: Into<Vec<u8>>>(&self, topic: &str, payload: P, qos: Qos) -> Result<i64, StoreError> {
        let payload: Vec<u8> = payload.into();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (topic, payload, qos, sent) VALUES (?1, ?2, ?3, 0)",
            params![topic, payload, qos.as_i64()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fire-and-forget flavour: a failing store costs the message, never the caller.
    pub fn enqueue_logged<P: Into<Vec<u8>>>(&self, topic: &str, payload: P, qos: Qos) -> Option<i64> {
        match self.enqueue(topic, payload, qos) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(topic, error = %e, "outbox unavailable; message dropped");
                None
            }
        }
    }

    /// All unsent messages, oldest first.
    pub fn unsent(&self) -> Result<Vec<OutboxMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, topic, payload, qos FROM messages WHERE sent = 0 ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OutboxMessage {
                    id: row.get(0)?,
                    topic: row.get(1)?,
                    payload: row.get(2)?,
                    qos: Qos::from_i64(row.get(3)?),
                    sent: false,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_sent(&self, id: i64) -> Result<(), StoreError> {
        self.conn.lock().execute("UPDATE messages SET sent = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn stats(&self) -> Result<OutboxStats, StoreError> {
        let (pending, sent): (i64, i64) = self.conn.lock().query_row(
            "SELECT COALESCE(SUM(sent = 0), 0), COALESCE(SUM(sent = 1), 0) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(OutboxStats { pending: pending as u64, sent: sent as u64 })
    }
}

/// Drains the outbox into the remote link on every tick.
pub struct Resender {
    outbox: Outbox,
    publisher: Arc<dyn RemotePublisher>,
}

impl Resender {
    pub fn new(outbox: Outbox, publisher: Arc<dyn RemotePublisher>) -> Self {
        Self { outbox, publisher }
    }

    /// One delivery pass. Returns how many messages were marked sent.
    pub async fn resend_unsent(&self) -> Result<usize, StoreError> {
        let pending = self.outbox.unsent()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        for msg in &pending {
            match self.publisher.publish(&msg.topic, &msg.payload, msg.qos).await {
                Ok(()) => {
                    self.outbox.mark_sent(msg.id)?;
                    delivered += 1;
                }
                Err(LinkError::NotConnected) => {
                    debug!(pending = pending.len(), "uplink down; holding outbox");
                    break;
                }
                Err(LinkError::Busy) => {
                    debug!(delivered, "client queue full; resuming next pass");
                    break;
                }
                Err(e) => warn!(id = msg.id, topic = %msg.topic, error = %e, "publish failed; will retry"),
            }
        }

        if delivered > 0 {
            info!(delivered, remaining = pending.len() - delivered, "outbox drained");
        }
        Ok(delivered)
    }
}

#[async_trait]
impl PeriodicTask for Resender {
    fn name(&self) -> &'static str {
        "outbox-resender"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.resend_unsent().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_devkit::MockMqttClient;

    #[test]
    fn test_enqueue_assigns_increasing_ids() {
        let outbox = Outbox::open_in_memory().unwrap();
        let a = outbox.enqueue("beehub/weather", "{}", Qos::AtLeastOnce).unwrap();
        let b = outbox.enqueue("alerts", "{}", Qos::AtMostOnce).unwrap();
        assert!(b > a);

        let unsent = outbox.unsent().unwrap();
        assert_eq!(unsent.len(), 2);
        assert_eq!(unsent[1].qos, Qos::AtMostOnce);
        assert!(!unsent[0].sent);
    }

    #[test]
    fn test_mark_sent_hides_message() {
        let outbox = Outbox::open_in_memory().unwrap();
        let id = outbox.enqueue("alerts", b"raw".to_vec(), Qos::AtLeastOnce).unwrap();
        outbox.mark_sent(id).unwrap();
        assert!(outbox.unsent().unwrap().is_empty());
        assert_eq!(outbox.stats().unwrap(), OutboxStats { pending: 0, sent: 1 });
    }

    #[test]
    fn test_messages_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        {
            let outbox = Outbox::open(&path).unwrap();
            outbox.enqueue("beehub/status/hive1", r#"{"camera":"hive1"}"#, Qos::AtLeastOnce).unwrap();
            outbox.enqueue("beehub/weather", r#"{"temp":20.0}"#, Qos::AtLeastOnce).unwrap();
            // process dies here, nothing was resent
        }
        let outbox = Outbox::open(&path).unwrap();
        let unsent = outbox.unsent().unwrap();
        assert_eq!(unsent.len(), 2);
        assert_eq!(unsent[0].payload, br#"{"camera":"hive1"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_unreachable_broker_then_recovery() {
        let outbox = Outbox::open_in_memory().unwrap();
        for n in 0..3 {
            outbox.enqueue(&format!("beehub/status/hive{n}"), "{}", Qos::AtLeastOnce).unwrap();
        }
        let broker = MockMqttClient::new();
        broker.set_reachable(false);
        let resender = Resender::new(outbox.clone(), Arc::new(broker.clone()));

        for _ in 0..2 {
            assert_eq!(resender.resend_unsent().await.unwrap(), 0);
            assert_eq!(outbox.unsent().unwrap().len(), 3);
        }

        broker.set_reachable(true);
        assert_eq!(resender.resend_unsent().await.unwrap(), 3);
        assert!(outbox.unsent().unwrap().is_empty());
        assert_eq!(broker.get_published_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_crash_before_commit_replays_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        let broker = MockMqttClient::new();
        {
            let outbox = Outbox::open(&path).unwrap();
            let id = outbox.enqueue("beehub/weather", "{}", Qos::AtLeastOnce).unwrap();
            // published, but the process dies before mark_sent
            let msg = &outbox.unsent().unwrap()[0];
            assert_eq!(msg.id, id);
            broker.publish(&msg.topic, rumqttc::QoS::AtLeastOnce, false, msg.payload.clone()).await.unwrap();
        }
        let outbox = Outbox::open(&path).unwrap();
        let resender = Resender::new(outbox.clone(), Arc::new(broker.clone()));
        assert_eq!(resender.resend_unsent().await.unwrap(), 1);
        // duplicate on the wire, never a loss
        assert_eq!(broker.find_messages_by_topic("beehub/weather").len(), 2);
    }
}
