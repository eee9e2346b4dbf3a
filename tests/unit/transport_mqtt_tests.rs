use async_trait::async_trait;
use mqtt_bindings::domain::{MqttMessage, QualityOfService, TopicFilter};
use mqtt_bindings::transport::mqtt::{
    DeliveryError, MqttConnectionError, MqttMessageProcessor,
};
use std::sync::{Arc, Mutex};

#[path = "../support/mod.rs"]
mod support;

use support::mocks::MockBroker;
use support::{connection, message, wait_for};

#[derive(Default)]
struct RecordingProcessor {
    received: Mutex<Vec<MqttMessage>>,
    fail_topic: Option<String>,
    panic_topic: Option<String>,
}

impl RecordingProcessor {
    fn failing_on(topic: &str) -> Self {
        Self {
            fail_topic: Some(topic.to_string()),
            ..Self::default()
        }
    }

    fn panicking_on(topic: &str) -> Self {
        Self {
            panic_topic: Some(topic.to_string()),
            ..Self::default()
        }
    }

    fn topics(&self) -> Vec<String> {
        self.received
            .lock()
            .expect("received")
            .iter()
            .map(|message| message.topic().to_string())
            .collect()
    }
}

#[async_trait]
impl MqttMessageProcessor for RecordingProcessor {
    async fn process(&self, message: MqttMessage) -> Result<(), DeliveryError> {
        let topic = message.topic().to_string();
        self.received.lock().expect("received").push(message);
        if self.panic_topic.as_deref() == Some(topic.as_str()) {
            panic!("processor blew up on {topic}");
        }
        if self.fail_topic.as_deref() == Some(topic.as_str()) {
            return Err(DeliveryError::new(topic, "rejected"));
        }
        Ok(())
    }
}

fn filter(topic: &str) -> TopicFilter {
    TopicFilter::new(topic, QualityOfService::AtLeastOnce).expect("filter")
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_opens_one_session() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "shared");

    connection.start(None).await.expect("first start");
    connection.start(None).await.expect("second start");

    assert_eq!(broker.connect_count(), 1);
    assert!(connection.is_connected());
    assert!(connection.is_running().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_open_one_session() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "shared");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let connection = Arc::clone(&connection);
        handles.push(tokio::spawn(async move { connection.start(None).await }));
    }
    for handle in handles {
        handle.await.expect("join").expect("start");
    }

    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent_and_safe_before_start() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "shared");

    connection.stop().await.expect("stop before start");
    assert_eq!(broker.disconnect_count(), 0);

    connection.start(None).await.expect("start");
    connection.stop().await.expect("first stop");
    connection.stop().await.expect("second stop");

    assert_eq!(broker.disconnect_count(), 1);
    assert!(!connection.is_connected());
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_disconnect_does_not_block_stop() {
    let broker = MockBroker::new();
    broker.hang_disconnects("stalled-client");
    let connection = connection(&broker, "stalled");
    connection.start(None).await.expect("start");

    let result = tokio::time::timeout(std::time::Duration::from_secs(10), connection.stop())
        .await
        .expect("stop completes despite a stalled disconnect");

    assert!(matches!(result, Err(MqttConnectionError::Stop { .. })));
    assert!(!connection.is_connected());
    assert!(!connection.is_running().await);
    connection.stop().await.expect("later stop is a no-op");
}

#[tokio::test(flavor = "multi_thread")]
async fn setup_failure_surfaces_to_the_caller() {
    let broker = MockBroker::new();
    broker.fail_next_connect("not authorised");
    let connection = connection(&broker, "secured");
    let processor: Arc<dyn MqttMessageProcessor> = Arc::new(RecordingProcessor::default());

    let err = connection
        .start(Some(processor))
        .await
        .expect_err("connect must fail");
    assert!(matches!(err, MqttConnectionError::Connect { .. }));
    assert!(err.to_string().contains("not authorised"));
    assert_eq!(connection.processor_count(), 0);
    assert!(!connection.is_connected());

    connection.start(None).await.expect("later start succeeds");
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_without_session_is_rejected() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "idle");

    let err = connection
        .publish(message("a/b", "x"))
        .await
        .expect_err("no session");
    assert!(matches!(err, MqttConnectionError::NotStarted { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_errors_carry_the_topic() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "out");
    connection.start(None).await.expect("start");
    broker.fail_publishes(Some("quota exceeded"));

    let err = connection
        .publish(message("metrics/cpu", "1"))
        .await
        .expect_err("publish fails");
    match err {
        MqttConnectionError::Publish { topic, source, .. } => {
            assert_eq!(topic, "metrics/cpu");
            assert!(source.to_string().contains("quota exceeded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_fan_out_to_every_processor_in_order() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "shared");
    let first = Arc::new(RecordingProcessor::default());
    let second = Arc::new(RecordingProcessor::default());

    connection
        .start(Some(first.clone()))
        .await
        .expect("start first");
    connection
        .start(Some(second.clone()))
        .await
        .expect("start second");
    connection
        .start(Some(first.clone()))
        .await
        .expect("same processor again");
    assert_eq!(connection.processor_count(), 2);

    connection
        .subscribe(&[filter("orders/#")])
        .await
        .expect("subscribe");
    for n in 0..5 {
        broker.publish_external(message(&format!("orders/{n}"), "{}"));
    }

    wait_for(2_000, || first.topics().len() == 5 && second.topics().len() == 5).await;
    let expected: Vec<String> = (0..5).map(|n| format!("orders/{n}")).collect();
    assert_eq!(first.topics(), expected);
    assert_eq!(second.topics(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_processor_does_not_stop_delivery() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "resilient");
    let failing = Arc::new(RecordingProcessor::failing_on("jobs/2"));
    let panicking = Arc::new(RecordingProcessor::panicking_on("jobs/3"));

    connection
        .start(Some(failing.clone()))
        .await
        .expect("start");
    connection.register_processor(panicking.clone());
    connection.subscribe(&[filter("jobs/+")]).await.expect("subscribe");

    for n in 1..=4 {
        broker.publish_external(message(&format!("jobs/{n}"), "work"));
    }

    wait_for(2_000, || failing.topics().len() == 4 && panicking.topics().len() == 4).await;
    assert_eq!(failing.topics().last().map(String::as_str), Some("jobs/4"));
    assert_eq!(panicking.topics().last().map(String::as_str), Some("jobs/4"));
    assert!(connection.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriptions_accumulate_and_unsubscribe_removes() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "subs");
    connection.start(None).await.expect("start");

    let mut handles = Vec::new();
    for topic in ["a/1", "a/2", "a/3"] {
        let connection = Arc::clone(&connection);
        handles.push(tokio::spawn(async move {
            connection.subscribe(&[filter(topic)]).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("subscribe");
    }

    assert_eq!(broker.active_subscriptions().len(), 3);
    assert_eq!(connection.subscriptions().await.len(), 3);

    connection
        .unsubscribe(&["a/2".to_string()])
        .await
        .expect("unsubscribe");
    let remaining: Vec<String> = broker.active_subscriptions().into_iter().collect();
    assert_eq!(remaining, vec!["a/1".to_string(), "a/3".to_string()]);

    connection.subscribe(&[]).await.expect("empty subscribe");
    connection.unsubscribe(&[]).await.expect("empty unsubscribe");
    assert_eq!(broker.subscribe_calls().len(), 3);
    assert_eq!(broker.unsubscribe_calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriptions_made_before_start_are_applied_on_start() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "early");

    connection
        .subscribe(&[filter("early/topic")])
        .await
        .expect("record subscription");
    assert!(broker.subscribe_calls().is_empty());

    connection.start(None).await.expect("start");
    assert!(broker.active_subscriptions().contains("early/topic"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_flips_connected_flag_and_resubscribes() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "flaky");
    let processor = Arc::new(RecordingProcessor::default());

    connection
        .start(Some(processor.clone()))
        .await
        .expect("start");
    connection
        .subscribe(&[filter("telemetry/#")])
        .await
        .expect("subscribe");
    assert!(connection.is_connected());

    broker.drop_connections("network unreachable");
    wait_for(1_000, || !connection.is_connected()).await;
    assert!(broker.active_subscriptions().is_empty());

    broker.fail_next_poll("connection refused");
    broker.restore_connections();
    wait_for(2_000, || connection.is_connected()).await;
    wait_for(2_000, || broker.active_subscriptions().contains("telemetry/#")).await;

    broker.publish_external(message("telemetry/after", "{}"));
    wait_for(2_000, || processor.topics() == vec!["telemetry/after".to_string()]).await;
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_connection_can_start_a_fresh_session() {
    let broker = MockBroker::new();
    let connection = connection(&broker, "restart");

    connection.start(None).await.expect("start");
    connection.subscribe(&[filter("keep/me")]).await.expect("subscribe");
    connection.stop().await.expect("stop");
    connection.start(None).await.expect("restart");

    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.open_sessions(), 1);
    assert!(broker.active_subscriptions().contains("keep/me"));
}
