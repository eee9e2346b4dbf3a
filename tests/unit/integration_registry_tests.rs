use mqtt_bindings::integration::registry::{ConnectionRegistry, ConnectionRegistryError};
use mqtt_bindings::retry::RetrySettings;
use std::sync::Arc;

#[path = "../support/mod.rs"]
mod support;

use support::descriptor;
use support::mocks::MockBroker;

fn registry(broker: &MockBroker) -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new(
        broker.client_factory(),
        RetrySettings::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_or_create_yields_one_connection() {
    let broker = MockBroker::new();
    let registry = registry(&broker);
    let descriptor = descriptor("MqttConnection");

    let mut handles = Vec::new();
    for _ in 0..32 {
        let registry = Arc::clone(&registry);
        let descriptor = descriptor.clone();
        handles.push(tokio::spawn(async move {
            let connection = registry.get_or_create(&descriptor);
            connection.start(None).await.expect("start");
            connection
        }));
    }

    let mut connections = Vec::new();
    for handle in handles {
        connections.push(handle.await.expect("join"));
    }

    assert_eq!(registry.len(), 1);
    assert!(connections
        .iter()
        .all(|connection| Arc::ptr_eq(connection, &connections[0])));
    assert_eq!(broker.connect_count(), 1);
}

#[test]
fn second_trigger_on_same_connection_is_rejected() {
    let broker = MockBroker::new();
    let registry = registry(&broker);
    let descriptor = descriptor("MqttConnection");

    registry
        .get_or_create_for_trigger("first", &descriptor)
        .expect("first trigger");
    let err = registry
        .get_or_create_for_trigger("second", &descriptor)
        .expect_err("duplicate trigger");

    assert_eq!(
        err,
        ConnectionRegistryError::DuplicateConnection {
            connection: "MqttConnection".to_string(),
            existing_binding: "first".to_string(),
            binding: "second".to_string(),
        }
    );
}

#[test]
fn trigger_and_outputs_may_share() {
    let broker = MockBroker::new();
    let registry = registry(&broker);
    let descriptor = descriptor("MqttConnection");

    let trigger = registry
        .get_or_create_for_trigger("listener", &descriptor)
        .expect("trigger");
    let output = registry.get_or_create(&descriptor);
    let another_output = registry.get_or_create(&descriptor);

    assert!(Arc::ptr_eq(&trigger, &output));
    assert!(Arc::ptr_eq(&output, &another_output));
    assert_eq!(registry.names(), vec!["MqttConnection".to_string()]);
}

#[test]
fn repeated_binding_name_cannot_claim_twice() {
    let broker = MockBroker::new();
    let registry = registry(&broker);
    let descriptor = descriptor("MqttConnection");

    registry
        .get_or_create_for_trigger("listener", &descriptor)
        .expect("claim");
    let err = registry
        .get_or_create_for_trigger("listener", &descriptor)
        .expect_err("second claim by the same binding name");

    assert_eq!(
        err,
        ConnectionRegistryError::DuplicateConnection {
            connection: "MqttConnection".to_string(),
            existing_binding: "listener".to_string(),
            binding: "listener".to_string(),
        }
    );
    assert_eq!(registry.len(), 1);
}

#[test]
fn distinct_names_get_distinct_connections() {
    let broker = MockBroker::new();
    let registry = registry(&broker);

    let a = registry
        .get_or_create_for_trigger("a", &descriptor("ConnA"))
        .expect("a");
    let b = registry
        .get_or_create_for_trigger("b", &descriptor("ConnB"))
        .expect("b");

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 2);
    assert!(registry.get("ConnA").is_some());
    assert!(registry.get("Missing").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_all_stops_started_and_idle_connections() {
    let broker = MockBroker::new();
    let registry = registry(&broker);

    let started = registry.get_or_create(&descriptor("Started"));
    started.start(None).await.expect("start");
    registry.get_or_create(&descriptor("NeverStarted"));

    let report = registry.disconnect_all().await;
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 2);
    assert_eq!(broker.disconnect_count(), 1);
    assert_eq!(broker.open_sessions(), 0);

    let again = registry.disconnect_all().await;
    assert!(again.is_clean());
    assert_eq!(broker.disconnect_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_all_continues_past_failing_connections() {
    let broker = MockBroker::new();
    broker.fail_disconnects("Broken-client", "socket already gone");
    let registry = registry(&broker);

    for name in ["Broken", "Healthy", "Other"] {
        let connection = registry.get_or_create(&descriptor(name));
        connection.start(None).await.expect("start");
    }

    let report = registry.disconnect_all().await;

    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 1);
    let (failed_name, failure) = &report.failed[0];
    assert_eq!(failed_name, "Broken");
    assert!(failure.to_string().contains("Broken"));
    let mut stopped = report.stopped.clone();
    stopped.sort();
    assert_eq!(stopped, vec!["Healthy".to_string(), "Other".to_string()]);
    assert_eq!(broker.disconnect_count(), 2);
    assert!(!registry
        .get("Broken")
        .expect("still registered")
        .is_running()
        .await);
}
