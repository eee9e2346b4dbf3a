#![forbid(unsafe_code)]

//! Output binding: publishes function results through a shared connection.

use crate::binding_event;
use crate::config::ConnectWaitPolicy;
use crate::domain::MqttMessage;
use crate::transport::mqtt::{MqttConnection, MqttConnectionError};
use crate::transport::runtime::poll_until;
use std::sync::Arc;

const TARGET: &str = "mqtt_bindings::collector";

pub struct MqttMessageCollector {
    connection: Arc<MqttConnection>,
    wait: ConnectWaitPolicy,
}

impl MqttMessageCollector {
    pub fn new(connection: Arc<MqttConnection>, wait: ConnectWaitPolicy) -> Self {
        Self { connection, wait }
    }

    pub fn connection(&self) -> &Arc<MqttConnection> {
        &self.connection
    }

    /// Publishes one message, starting the connection first if nothing has yet.
    /// If the connected flag does not come up within the wait budget the publish is
    /// attempted anyway and its own error is returned.
    pub async fn add(&self, message: MqttMessage) -> Result<(), MqttConnectionError> {
        if !self.connection.is_connected() {
            self.connection.start(None).await?;

            let connection = Arc::clone(&self.connection);
            let ready = poll_until(self.wait.budget, self.wait.interval, move || {
                connection.is_connected()
            })
            .await;

            if !ready {
                binding_event!(
                    warn,
                    TARGET,
                    "publish_wait_exhausted",
                    connection = self.connection.name(),
                    topic = message.topic(),
                    budget_ms = self.wait.budget.as_millis()
                );
            }
        }

        self.connection.publish(message).await
    }

    /// Messages are published as they are added; nothing is buffered.
    pub async fn flush(&self) -> Result<(), MqttConnectionError> {
        Ok(())
    }
}

impl std::fmt::Debug for MqttMessageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttMessageCollector")
            .field("connection", &self.connection.name())
            .field("wait", &self.wait)
            .finish()
    }
}
