/*!
# Hive DevKit

Test support for the hub relay:
- recording MQTT publisher with a reachability switch, standing in for the cloud broker
- builders for the payloads field units put on the LAN broker
*/

pub mod mqtt_stub;
pub mod payloads;

pub use mqtt_stub::{MockMessage, MockMqttClient};
pub use payloads::{FieldAlertBuilder, HeartbeatBuilder};

/// Routes `log` output of the devkit to the test runner; safe to call repeatedly.
pub fn init_test_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
