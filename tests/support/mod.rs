#![allow(dead_code)]


use mqtt_bindings::config::connection_string::parse;
use mqtt_bindings::config::ConnectionDescriptor;
use mqtt_bindings::domain::{MqttMessage, QualityOfService};
use mqtt_bindings::retry::RetrySettings;
use mqtt_bindings::transport::mqtt::MqttConnection;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

use mocks::MockBroker;

pub fn descriptor(name: &str) -> ConnectionDescriptor {
    parse(
        &format!("Server=broker.test;ClientId={name}-client"),
        name,
    )
    .expect("test descriptor")
}

pub fn fast_reconnect() -> RetrySettings {
    RetrySettings::new(Duration::from_millis(50), Duration::from_millis(100), 2.0)
}

pub fn connection(broker: &MockBroker, name: &str) -> Arc<MqttConnection> {
    Arc::new(MqttConnection::new(
        descriptor(name),
        broker.client_factory(),
        fast_reconnect(),
    ))
}

pub fn message(topic: &str, payload: &str) -> MqttMessage {
    MqttMessage::new(
        topic,
        payload.as_bytes().to_vec(),
        QualityOfService::AtLeastOnce,
        false,
    )
}

pub async fn wait_for<F>(timeout_ms: u64, mut predicate: F)
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_millis(timeout_ms), async {
        loop {
            if predicate() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition to complete within timeout");
}
