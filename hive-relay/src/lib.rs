//! Hub relay: field-unit heartbeat liveness on the LAN broker and a durable
//! store-and-forward uplink to the cloud broker.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod forwarders;
pub mod health;
pub mod heartbeat;
pub mod liveness;
pub mod local_link;
pub mod models;
pub mod monitor;
pub mod outbox;
pub mod relay;
pub mod remote_link;
pub mod state;
pub mod store;
pub mod tasks;
