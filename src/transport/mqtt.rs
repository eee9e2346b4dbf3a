#![forbid(unsafe_code)]

//! One persistent MQTT session per logical connection name.
//!
//! A connection owns a driver task that polls the client's event stream and a
//! dispatcher task that hands received messages to every registered processor, one
//! message at a time. Disconnects are logged and recovered by the client's own
//! reconnect; recorded subscriptions are re-issued once the session is back.

use crate::binding_event;
use crate::config::ConnectionDescriptor;
use crate::domain::{MqttMessage, TopicFilter};
use crate::metrics::metrics;
use crate::retry::{RetryBackoff, RetrySettings};
use crate::transport::client::{
    MqttClientError, MqttClientFactory, MqttEventStream, MqttSession, SessionEvent,
};
use crate::transport::runtime::sleep_with_shutdown;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "mqtt_bindings::mqtt";
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Receives every message delivered on a connection.
#[async_trait]
pub trait MqttMessageProcessor: Send + Sync {
    async fn process(&self, message: MqttMessage) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Error)]
#[error("failed to process message on `{topic}`: {reason}")]
pub struct DeliveryError {
    pub topic: String,
    pub reason: String,
}

impl DeliveryError {
    pub fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MqttConnectionError {
    #[error("failed to establish mqtt session `{connection}`: {source}")]
    Connect {
        connection: String,
        #[source]
        source: MqttClientError,
    },
    #[error("mqtt connection `{connection}` failed to subscribe to [{topics}]: {source}")]
    Subscribe {
        connection: String,
        topics: String,
        #[source]
        source: MqttClientError,
    },
    #[error("mqtt connection `{connection}` failed to unsubscribe from [{topics}]: {source}")]
    Unsubscribe {
        connection: String,
        topics: String,
        #[source]
        source: MqttClientError,
    },
    #[error("mqtt connection `{connection}` failed to publish to `{topic}`: {source}")]
    Publish {
        connection: String,
        topic: String,
        #[source]
        source: MqttClientError,
    },
    #[error("mqtt connection `{connection}` has no active session")]
    NotStarted { connection: String },
    #[error("mqtt connection `{connection}` did not stop cleanly: {source}")]
    Stop {
        connection: String,
        #[source]
        source: MqttClientError,
    },
}

enum ConnectionState {
    Idle,
    Running(SessionTasks),
    Stopped,
}

struct SessionTasks {
    shutdown: CancellationToken,
    driver: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct ConnectionShared {
    name: String,
    client_id: String,
    connected: AtomicBool,
    session: RwLock<Option<Arc<dyn MqttSession>>>,
    processors: RwLock<Vec<Arc<dyn MqttMessageProcessor>>>,
    subscriptions: AsyncMutex<BTreeMap<String, TopicFilter>>,
}

impl ConnectionShared {
    fn current_session(&self) -> Option<Arc<dyn MqttSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn processors(&self) -> Vec<Arc<dyn MqttMessageProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mark_connected(&self) -> bool {
        let was_connected = self.connected.swap(true, Ordering::SeqCst);
        if !was_connected {
            binding_event!(
                info,
                TARGET,
                "connection_reconnected",
                connection = self.name,
                client_id = self.client_id
            );
        }
        !was_connected
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            metrics().inc_mqtt_disconnects();
            binding_event!(
                warn,
                TARGET,
                "connection_lost",
                connection = self.name,
                client_id = self.client_id,
                error = reason
            );
        }
    }
}

pub struct MqttConnection {
    descriptor: ConnectionDescriptor,
    client_factory: Arc<dyn MqttClientFactory>,
    reconnect: RetrySettings,
    state: AsyncMutex<ConnectionState>,
    shared: Arc<ConnectionShared>,
}

impl MqttConnection {
    pub fn new(
        descriptor: ConnectionDescriptor,
        client_factory: Arc<dyn MqttClientFactory>,
        reconnect: RetrySettings,
    ) -> Self {
        let shared = Arc::new(ConnectionShared {
            name: descriptor.name().to_string(),
            client_id: descriptor.client_id().to_string(),
            connected: AtomicBool::new(false),
            session: RwLock::new(None),
            processors: RwLock::new(Vec::new()),
            subscriptions: AsyncMutex::new(BTreeMap::new()),
        });

        Self {
            descriptor,
            client_factory,
            reconnect,
            state: AsyncMutex::new(ConnectionState::Idle),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Diagnostic only; delivery and publish never depend on it.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ConnectionState::Running(_))
    }

    /// Starts the session unless it is already running. A supplied processor joins
    /// the fan-out list whether or not this call created the session.
    pub async fn start(
        &self,
        processor: Option<Arc<dyn MqttMessageProcessor>>,
    ) -> Result<(), MqttConnectionError> {
        let mut state = self.state.lock().await;

        if matches!(*state, ConnectionState::Running(_)) {
            if let Some(processor) = processor {
                self.register_processor(processor);
            }
            return Ok(());
        }

        binding_event!(
            info,
            TARGET,
            "connection_starting",
            connection = self.name(),
            server = self.descriptor.server(),
            port = self.descriptor.port(),
            tls = self.descriptor.tls()
        );

        let parts = self
            .client_factory
            .connect(&self.descriptor)
            .await
            .map_err(|source| {
                binding_event!(
                    error,
                    TARGET,
                    "connection_failed",
                    connection = self.name(),
                    error = source
                );
                MqttConnectionError::Connect {
                    connection: self.name().to_string(),
                    source,
                }
            })?;

        if let Some(processor) = processor {
            self.register_processor(processor);
        }

        *self
            .shared
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&parts.session));
        self.shared.connected.store(true, Ordering::SeqCst);

        let recorded: Vec<TopicFilter> = self
            .shared
            .subscriptions
            .lock()
            .await
            .values()
            .cloned()
            .collect();

        let shutdown = CancellationToken::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive_session(
            Arc::clone(&self.shared),
            parts.events,
            sender,
            shutdown.clone(),
            self.reconnect.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch_messages(
            Arc::clone(&self.shared),
            receiver,
            shutdown.clone(),
        ));

        *state = ConnectionState::Running(SessionTasks {
            shutdown,
            driver,
            dispatcher,
        });
        drop(state);

        if !recorded.is_empty() {
            if let Err(err) = parts.session.subscribe(&recorded).await {
                binding_event!(
                    warn,
                    TARGET,
                    "resubscribe_failed",
                    connection = self.name(),
                    topics = describe_filters(&recorded),
                    error = err
                );
            }
        }

        binding_event!(
            info,
            TARGET,
            "connection_started",
            connection = self.name(),
            client_id = self.descriptor.client_id()
        );
        Ok(())
    }

    pub fn register_processor(&self, processor: Arc<dyn MqttMessageProcessor>) {
        let mut processors = self
            .shared
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !processors
            .iter()
            .any(|existing| same_processor(existing, &processor))
        {
            processors.push(processor);
        }
    }

    pub fn unregister_processor(&self, processor: &Arc<dyn MqttMessageProcessor>) -> bool {
        let mut processors = self
            .shared
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = processors.len();
        processors.retain(|existing| !same_processor(existing, processor));
        processors.len() != before
    }

    pub fn processor_count(&self) -> usize {
        self.shared
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Subscribes and records the filters; recorded filters are re-issued after a
    /// reconnect or restart. Before the first start the filters are only recorded.
    pub async fn subscribe(&self, filters: &[TopicFilter]) -> Result<(), MqttConnectionError> {
        if filters.is_empty() {
            return Ok(());
        }

        let mut subscriptions = self.shared.subscriptions.lock().await;
        if let Some(session) = self.shared.current_session() {
            session
                .subscribe(filters)
                .await
                .map_err(|source| MqttConnectionError::Subscribe {
                    connection: self.name().to_string(),
                    topics: describe_filters(filters),
                    source,
                })?;
        }

        for filter in filters {
            subscriptions.insert(filter.topic().to_string(), filter.clone());
        }

        binding_event!(
            info,
            TARGET,
            "subscribed",
            connection = self.name(),
            topics = describe_filters(filters)
        );
        Ok(())
    }

    pub async fn unsubscribe(&self, topics: &[String]) -> Result<(), MqttConnectionError> {
        if topics.is_empty() {
            return Ok(());
        }

        let mut subscriptions = self.shared.subscriptions.lock().await;
        for topic in topics {
            subscriptions.remove(topic);
        }

        if let Some(session) = self.shared.current_session() {
            session
                .unsubscribe(topics)
                .await
                .map_err(|source| MqttConnectionError::Unsubscribe {
                    connection: self.name().to_string(),
                    topics: topics.join(", "),
                    source,
                })?;
        }

        binding_event!(
            info,
            TARGET,
            "unsubscribed",
            connection = self.name(),
            topics = topics.join(", ")
        );
        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<TopicFilter> {
        self.shared
            .subscriptions
            .lock()
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn publish(&self, message: MqttMessage) -> Result<(), MqttConnectionError> {
        let session =
            self.shared
                .current_session()
                .ok_or_else(|| MqttConnectionError::NotStarted {
                    connection: self.name().to_string(),
                })?;

        let topic = message.topic().to_string();
        match session.publish(message).await {
            Ok(()) => {
                metrics().inc_mqtt_publish_success();
                Ok(())
            }
            Err(source) => {
                metrics().inc_mqtt_publish_failure();
                binding_event!(
                    error,
                    TARGET,
                    "publish_failed",
                    connection = self.name(),
                    topic = topic,
                    error = source
                );
                Err(MqttConnectionError::Publish {
                    connection: self.name().to_string(),
                    topic,
                    source,
                })
            }
        }
    }

    /// Stops the session. Safe to call repeatedly and before any start. The disconnect
    /// and the driver shutdown are each bounded by the stop grace period.
    pub async fn stop(&self) -> Result<(), MqttConnectionError> {
        let mut state = self.state.lock().await;
        let tasks = match std::mem::replace(&mut *state, ConnectionState::Stopped) {
            ConnectionState::Running(tasks) => tasks,
            ConnectionState::Idle => {
                *state = ConnectionState::Idle;
                return Ok(());
            }
            ConnectionState::Stopped => return Ok(()),
        };

        let session = self
            .shared
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let result = match session {
            Some(session) => match timeout(STOP_GRACE, session.disconnect()).await {
                Ok(result) => result,
                Err(_) => Err(MqttClientError::new(format!(
                    "disconnect did not complete within {}ms",
                    STOP_GRACE.as_millis()
                ))),
            },
            None => Ok(()),
        };

        let SessionTasks {
            shutdown,
            mut driver,
            dispatcher,
        } = tasks;

        if result.is_err() || timeout(STOP_GRACE, &mut driver).await.is_err() {
            shutdown.cancel();
            let _ = driver.await;
        }
        shutdown.cancel();
        drop(dispatcher);

        self.shared.connected.store(false, Ordering::SeqCst);
        binding_event!(info, TARGET, "connection_stopped", connection = self.name());

        result.map_err(|source| MqttConnectionError::Stop {
            connection: self.name().to_string(),
            source,
        })
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if let ConnectionState::Running(tasks) = &*state {
                tasks.shutdown.cancel();
            }
        }
    }
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn same_processor(lhs: &Arc<dyn MqttMessageProcessor>, rhs: &Arc<dyn MqttMessageProcessor>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(lhs) as *const (),
        Arc::as_ptr(rhs) as *const (),
    )
}

fn describe_filters(filters: &[TopicFilter]) -> String {
    filters
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

async fn drive_session(
    shared: Arc<ConnectionShared>,
    mut events: Box<dyn MqttEventStream>,
    sender: mpsc::UnboundedSender<MqttMessage>,
    shutdown: CancellationToken,
    reconnect: RetrySettings,
) {
    let mut backoff = RetryBackoff::new(reconnect);
    let mut resubscribe = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.next_event() => event,
        };

        match event {
            Ok(SessionEvent::Connected) => {
                backoff.on_success();
                shared.mark_connected();
                if std::mem::take(&mut resubscribe) {
                    tokio::spawn(resubscribe_all(Arc::clone(&shared)));
                }
            }
            Ok(SessionEvent::Message(message)) => {
                metrics().inc_mqtt_messages_received();
                if sender.send(message).is_err() {
                    break;
                }
            }
            Ok(SessionEvent::Disconnected { reason }) => {
                shared.mark_disconnected(&reason);
                resubscribe = true;
            }
            Ok(SessionEvent::Closed) => break,
            Err(err) => {
                shared.mark_disconnected(&err.to_string());
                resubscribe = true;
                let delay = backoff.on_failure();
                tracing::debug!(
                    target: TARGET,
                    event = "reconnect_backoff",
                    connection = %shared.name,
                    delay_ms = delay.as_millis() as u64
                );
                if sleep_with_shutdown(delay, &shutdown).await {
                    break;
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
}

async fn resubscribe_all(shared: Arc<ConnectionShared>) {
    let subscriptions = shared.subscriptions.lock().await;
    let filters: Vec<TopicFilter> = subscriptions.values().cloned().collect();
    if filters.is_empty() {
        return;
    }
    let Some(session) = shared.current_session() else {
        return;
    };

    match session.subscribe(&filters).await {
        Ok(()) => binding_event!(
            info,
            TARGET,
            "resubscribed",
            connection = shared.name,
            topics = describe_filters(&filters)
        ),
        Err(err) => binding_event!(
            warn,
            TARGET,
            "resubscribe_failed",
            connection = shared.name,
            topics = describe_filters(&filters),
            error = err
        ),
    }
}

async fn dispatch_messages(
    shared: Arc<ConnectionShared>,
    mut receiver: mpsc::UnboundedReceiver<MqttMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let processors = shared.processors();
        if processors.is_empty() {
            tracing::debug!(
                target: TARGET,
                event = "message_dropped",
                connection = %shared.name,
                topic = %message.topic()
            );
            continue;
        }

        for processor in processors {
            let delivery = message.clone();
            let outcome = tokio::spawn(async move { processor.process(delivery).await }).await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => binding_event!(
                    error,
                    TARGET,
                    "message_processing_failed",
                    connection = shared.name,
                    topic = message.topic(),
                    error = err
                ),
                Err(join_err) => binding_event!(
                    error,
                    TARGET,
                    "message_processor_panicked",
                    connection = shared.name,
                    topic = message.topic(),
                    error = join_err
                ),
            }
        }
    }
}
