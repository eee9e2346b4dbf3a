#![forbid(unsafe_code)]

//! Seam between the connection manager and the MQTT client library.
//!
//! [`MqttClientFactory::connect`] establishes the first session synchronously so that
//! bad credentials or an unreachable broker surface to the caller. Afterwards the
//! [`MqttEventStream`] keeps driving the client, which reconnects on the next poll
//! after a failure.

use crate::config::{CertificateSource, ConnectionDescriptor, ConnectionOptions};
use crate::domain::{MqttMessage, TopicFilter};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeFilter, Transport,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct MqttClientError {
    message: String,
}

impl MqttClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the underlying session reports while it is being driven.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Message(MqttMessage),
    /// The session was closed on request and will not reconnect.
    Closed,
}

/// Request side of an established session. Calls may come from many tasks at once.
#[async_trait]
pub trait MqttSession: Send + Sync {
    async fn subscribe(&self, filters: &[TopicFilter]) -> Result<(), MqttClientError>;
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), MqttClientError>;
    async fn publish(&self, message: MqttMessage) -> Result<(), MqttClientError>;
    async fn disconnect(&self) -> Result<(), MqttClientError>;
}

/// Event side of an established session, owned by exactly one driver task.
#[async_trait]
pub trait MqttEventStream: Send {
    async fn next_event(&mut self) -> Result<SessionEvent, MqttClientError>;
}

pub struct MqttClientParts {
    pub session: Arc<dyn MqttSession>,
    pub events: Box<dyn MqttEventStream>,
}

#[async_trait]
pub trait MqttClientFactory: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<MqttClientParts, MqttClientError>;
}

/// Production factory backed by `rumqttc`.
#[derive(Debug, Clone, Default)]
pub struct RumqttcClientFactory {
    options: ConnectionOptions,
}

impl RumqttcClientFactory {
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl MqttClientFactory for RumqttcClientFactory {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<MqttClientParts, MqttClientError> {
        let options = build_mqtt_options(descriptor, &self.options)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.options.channel_capacity);

        timeout(self.options.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                MqttClientError::new(format!(
                    "timed out after {:?} connecting to {}:{}",
                    self.options.connect_timeout,
                    descriptor.server(),
                    descriptor.port()
                ))
            })??;

        Ok(MqttClientParts {
            session: Arc::new(RumqttcSession { client }),
            events: Box::new(RumqttcEventStream { eventloop }),
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), MqttClientError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(MqttClientError::new(format!(
                        "broker refused connection: {code:?}"
                    ))),
                };
            }
            Ok(_) => continue,
            Err(err) => return Err(MqttClientError::new(format!("mqtt connect failed: {err}"))),
        }
    }
}

struct RumqttcSession {
    client: AsyncClient,
}

#[async_trait]
impl MqttSession for RumqttcSession {
    async fn subscribe(&self, filters: &[TopicFilter]) -> Result<(), MqttClientError> {
        // rumqttc speaks 3.1.1 here; v5 subscription options are not transmitted.
        let request: Vec<SubscribeFilter> = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.topic().to_string(), filter.qos().into()))
            .collect();

        self.client
            .subscribe_many(request)
            .await
            .map_err(|err| MqttClientError::new(format!("subscribe request failed: {err}")))
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), MqttClientError> {
        for topic in topics {
            self.client.unsubscribe(topic.clone()).await.map_err(|err| {
                MqttClientError::new(format!("unsubscribe from `{topic}` failed: {err}"))
            })?;
        }
        Ok(())
    }

    async fn publish(&self, message: MqttMessage) -> Result<(), MqttClientError> {
        self.client
            .publish(
                message.topic().to_string(),
                message.qos().into(),
                message.retain(),
                message.payload().to_vec(),
            )
            .await
            .map_err(|err| MqttClientError::new(format!("publish request failed: {err}")))
    }

    async fn disconnect(&self) -> Result<(), MqttClientError> {
        // The request channel may be full while the broker is unreachable.
        self.client
            .try_disconnect()
            .map_err(|err| MqttClientError::new(format!("disconnect request failed: {err}")))
    }
}

struct RumqttcEventStream {
    eventloop: EventLoop,
}

#[async_trait]
impl MqttEventStream for RumqttcEventStream {
    async fn next_event(&mut self) -> Result<SessionEvent, MqttClientError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(SessionEvent::Connected),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(SessionEvent::Message(MqttMessage::new(
                        publish.topic,
                        publish.payload,
                        publish.qos.into(),
                        publish.retain,
                    )))
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Ok(SessionEvent::Disconnected {
                        reason: "broker sent DISCONNECT".to_string(),
                    })
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(SessionEvent::Closed),
                Ok(_) => continue,
                Err(err) => {
                    return Err(MqttClientError::new(format!("mqtt event loop error: {err}")))
                }
            }
        }
    }
}

fn build_mqtt_options(
    descriptor: &ConnectionDescriptor,
    tuning: &ConnectionOptions,
) -> Result<MqttOptions, MqttClientError> {
    let mut options =
        MqttOptions::new(descriptor.client_id(), descriptor.server(), descriptor.port());
    options.set_keep_alive(tuning.keep_alive.max(MIN_KEEP_ALIVE));
    options.set_clean_session(true);

    if let Some(user) = descriptor.username() {
        options.set_credentials(user, descriptor.password().unwrap_or(""));
    }

    if descriptor.tls() {
        options.set_transport(build_transport(descriptor)?);
    }

    Ok(options)
}

fn build_transport(descriptor: &ConnectionDescriptor) -> Result<Transport, MqttClientError> {
    match descriptor.certificate() {
        Some(CertificateSource::Inline(bytes)) => Ok(Transport::tls(bytes.clone(), None, None)),
        Some(CertificateSource::Path(path)) => {
            let ca = fs::read(path).map_err(|err| {
                MqttClientError::new(format!(
                    "failed to read mqtt certificate `{}`: {err}",
                    path.display()
                ))
            })?;
            Ok(Transport::tls(ca, None, None))
        }
        None => Ok(Transport::tls_with_default_config()),
    }
}
