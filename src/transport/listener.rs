#![forbid(unsafe_code)]

//! Trigger listener: one per trigger binding, layered over a shared connection.

use crate::binding_event;
use crate::domain::{MqttMessage, TopicFilter};
use crate::executor::{TriggerData, TriggerExecutor};
use crate::metrics::metrics;
use crate::transport::mqtt::{
    DeliveryError, MqttConnection, MqttConnectionError, MqttMessageProcessor,
};
use crate::transport::{ListenerState, TriggerListener};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "mqtt_bindings::listener";

#[derive(Debug, Clone, Error)]
pub enum MqttListenerError {
    #[error("trigger listener `{binding}` has been stopped and cannot be restarted")]
    Disposed { binding: String },
    #[error("trigger listener `{binding}` failed to start: {source}")]
    Start {
        binding: String,
        #[source]
        source: MqttConnectionError,
    },
}

struct ListenerProcessor {
    binding: String,
    connection: String,
    filters: Vec<TopicFilter>,
    executor: Arc<dyn TriggerExecutor>,
    cancel: CancellationToken,
}

impl ListenerProcessor {
    fn accepts(&self, topic: &str) -> bool {
        self.filters.iter().any(|filter| filter.matches(topic))
    }
}

#[async_trait]
impl MqttMessageProcessor for ListenerProcessor {
    async fn process(&self, message: MqttMessage) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() || !self.accepts(message.topic()) {
            return Ok(());
        }

        let topic = message.topic().to_string();
        let data = TriggerData::from_message(self.binding.clone(), message);
        let invocation = data.invocation_id();

        let outcome = {
            let _inflight = metrics().track_mqtt_trigger();
            self.executor.execute(data).await
        };

        match outcome {
            Ok(result) if result.succeeded() => {
                tracing::debug!(
                    target: TARGET,
                    event = "trigger_completed",
                    connection = %self.connection,
                    binding = %self.binding,
                    topic = %topic,
                    invocation_id = %invocation
                );
                Ok(())
            }
            Ok(result) => {
                metrics().inc_mqtt_trigger_failures();
                binding_event!(
                    error,
                    TARGET,
                    "trigger_function_failed",
                    connection = self.connection,
                    binding = self.binding,
                    topic = topic,
                    invocation_id = invocation,
                    error = result.error().unwrap_or("function reported failure")
                );
                Ok(())
            }
            Err(err) => {
                metrics().inc_mqtt_trigger_failures();
                Err(DeliveryError::new(topic, err.to_string()))
            }
        }
    }
}

/// Subscribes a trigger binding's topics on a shared connection and forwards
/// matching messages to the executor.
pub struct MqttListener {
    binding: String,
    connection: Arc<MqttConnection>,
    filters: Vec<TopicFilter>,
    processor: Arc<ListenerProcessor>,
    state: AsyncMutex<ListenerState>,
}

impl MqttListener {
    pub fn new(
        binding: impl Into<String>,
        connection: Arc<MqttConnection>,
        filters: Vec<TopicFilter>,
        executor: Arc<dyn TriggerExecutor>,
    ) -> Self {
        let binding = binding.into();
        let processor = Arc::new(ListenerProcessor {
            binding: binding.clone(),
            connection: connection.name().to_string(),
            filters: filters.clone(),
            executor,
            cancel: CancellationToken::new(),
        });

        Self {
            binding,
            connection,
            filters,
            processor,
            state: AsyncMutex::new(ListenerState::Created),
        }
    }

    pub fn connection(&self) -> &Arc<MqttConnection> {
        &self.connection
    }

    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }

    fn processor_handle(&self) -> Arc<dyn MqttMessageProcessor> {
        self.processor.clone()
    }

    pub async fn start_listening(&self) -> Result<(), MqttListenerError> {
        let mut state = self.state.lock().await;
        match *state {
            ListenerState::Subscribed => return Ok(()),
            ListenerState::Stopped => {
                return Err(MqttListenerError::Disposed {
                    binding: self.binding.clone(),
                })
            }
            ListenerState::Created => {}
        }

        let processor = self.processor_handle();
        let started = match self.connection.start(Some(Arc::clone(&processor))).await {
            Ok(()) => self.connection.subscribe(&self.filters).await,
            Err(err) => Err(err),
        };

        if let Err(source) = started {
            self.connection.unregister_processor(&processor);
            binding_event!(
                error,
                TARGET,
                "listener_start_failed",
                connection = self.connection.name(),
                binding = self.binding,
                error = source
            );
            return Err(MqttListenerError::Start {
                binding: self.binding.clone(),
                source,
            });
        }

        *state = ListenerState::Subscribed;
        binding_event!(
            info,
            TARGET,
            "listener_started",
            connection = self.connection.name(),
            binding = self.binding,
            topics = self
                .filters
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Tears the listener down. Failures along the way are logged, never returned.
    pub async fn stop_listening(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, ListenerState::Stopped);
        self.processor.cancel.cancel();

        if previous == ListenerState::Stopped {
            return;
        }

        if previous == ListenerState::Subscribed {
            let topics: Vec<String> = self
                .filters
                .iter()
                .map(|filter| filter.topic().to_string())
                .collect();
            if let Err(err) = self.connection.unsubscribe(&topics).await {
                binding_event!(
                    warn,
                    TARGET,
                    "listener_unsubscribe_failed",
                    connection = self.connection.name(),
                    binding = self.binding,
                    error = err
                );
            }
        }

        self.connection.unregister_processor(&self.processor_handle());

        if let Err(err) = self.connection.stop().await {
            binding_event!(
                warn,
                TARGET,
                "listener_connection_stop_failed",
                connection = self.connection.name(),
                binding = self.binding,
                error = err
            );
        }

        binding_event!(
            info,
            TARGET,
            "listener_stopped",
            connection = self.connection.name(),
            binding = self.binding
        );
    }
}

#[async_trait]
impl TriggerListener for MqttListener {
    fn binding(&self) -> &str {
        &self.binding
    }

    async fn state(&self) -> ListenerState {
        *self.state.lock().await
    }

    async fn start(&self) -> crate::error::Result<()> {
        self.start_listening().await?;
        Ok(())
    }

    async fn stop(&self) -> crate::error::Result<()> {
        self.stop_listening().await;
        Ok(())
    }

    async fn cancel(&self) -> crate::error::Result<()> {
        self.processor.cancel.cancel();
        self.stop_listening().await;
        Ok(())
    }
}

impl std::fmt::Debug for MqttListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttListener")
            .field("binding", &self.binding)
            .field("connection", &self.connection.name())
            .finish()
    }
}
