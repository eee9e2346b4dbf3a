#![forbid(unsafe_code)]

//! Host-facing entry points: turn binding attributes into listeners and collectors.

use crate::config::connection_string::parse as parse_connection_string;
use crate::config::resolver::{resolve_placeholders, resolve_setting, setting_name};
use crate::config::{
    ConfigurationError, ConnectWaitPolicy, ConnectionDescriptor, ConnectionOptions,
    MqttOutputAttribute, MqttTriggerAttribute, NameResolver,
};
use crate::domain::TopicFilter;
use crate::error::Error as BindingError;
use crate::executor::TriggerExecutor;
use crate::integration::registry::{ConnectionRegistry, ConnectionRegistryError, DisconnectReport};
use crate::transport::client::{MqttClientFactory, RumqttcClientFactory};
use crate::transport::collector::MqttMessageCollector;
use crate::transport::listener::MqttListener;
use crate::transport::mqtt::MqttConnection;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

const TARGET: &str = "mqtt_bindings::provider";

#[derive(Debug, Error)]
pub enum BindingProviderError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Registry(#[from] ConnectionRegistryError),
    #[error("connection factory `{factory}` is not registered")]
    UnknownConnectionFactory { factory: String },
    #[error("connection factory `{factory}` failed to build a connection: {reason}")]
    CustomConfig { factory: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Trigger,
    Output,
}

/// What a custom connection factory gets to see about the binding it serves.
#[derive(Clone)]
pub struct ConnectionFactoryContext {
    binding: Option<String>,
    kind: BindingKind,
    resolver: Arc<dyn NameResolver>,
}

impl ConnectionFactoryContext {
    pub fn binding(&self) -> Option<&str> {
        self.binding.as_deref()
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }

    pub fn setting(&self, name: &str) -> Option<String> {
        self.resolver.resolve(name)
    }
}

/// User-supplied connection construction, called with the binding's connection name.
pub type ConnectionFactoryFn = dyn Fn(&str, &ConnectionFactoryContext) -> Result<ConnectionDescriptor, BindingError>
    + Send
    + Sync;

/// Connection and topic set resolved for one trigger binding.
#[derive(Debug, Clone)]
pub struct TriggerBinding {
    pub connection: Arc<MqttConnection>,
    pub topics: Vec<TopicFilter>,
}

pub struct MqttBindingProvider {
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<dyn NameResolver>,
    connection_factories: HashMap<String, Arc<ConnectionFactoryFn>>,
    publish_wait: ConnectWaitPolicy,
}

impl MqttBindingProvider {
    pub fn new(registry: Arc<ConnectionRegistry>, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            registry,
            resolver,
            connection_factories: HashMap::new(),
            publish_wait: ConnectWaitPolicy::default(),
        }
    }

    /// Provider backed by `rumqttc` sessions tuned by `options`.
    pub fn with_rumqttc(resolver: Arc<dyn NameResolver>, options: &ConnectionOptions) -> Self {
        let client_factory: Arc<dyn MqttClientFactory> =
            Arc::new(RumqttcClientFactory::new(options.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            client_factory,
            options.reconnect.clone(),
        ));
        Self::new(registry, resolver).with_publish_wait(options.publish_wait)
    }

    pub fn with_publish_wait(mut self, wait: ConnectWaitPolicy) -> Self {
        self.publish_wait = wait;
        self
    }

    pub fn register_connection_factory<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str, &ConnectionFactoryContext) -> Result<ConnectionDescriptor, BindingError>
            + Send
            + Sync
            + 'static,
    {
        self.connection_factories
            .insert(name.into(), Arc::new(factory));
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Resolves the trigger's connection and topics. The connection is claimed for
    /// this trigger; a second trigger on the same connection name is rejected.
    pub fn trigger_binding(
        &self,
        attribute: &MqttTriggerAttribute,
    ) -> Result<TriggerBinding, BindingProviderError> {
        let topics = attribute
            .topic_filters(|topic| resolve_placeholders(self.resolver.as_ref(), topic))?;
        let descriptor = self.resolve_descriptor(
            attribute.connection_setting(),
            attribute.connection_factory(),
            Some(attribute.name()),
            BindingKind::Trigger,
        )?;
        let connection = self
            .registry
            .get_or_create_for_trigger(attribute.name(), &descriptor)?;

        tracing::info!(
            target: TARGET,
            event = "trigger_bound",
            binding = %attribute.name(),
            connection = %descriptor.name(),
            topics = topics.len()
        );
        Ok(TriggerBinding { connection, topics })
    }

    pub fn create_listener(
        &self,
        attribute: &MqttTriggerAttribute,
        executor: Arc<dyn TriggerExecutor>,
    ) -> Result<MqttListener, BindingProviderError> {
        let TriggerBinding { connection, topics } = self.trigger_binding(attribute)?;
        Ok(MqttListener::new(
            attribute.name(),
            connection,
            topics,
            executor,
        ))
    }

    /// Output bindings may share a connection with anything.
    pub fn create_collector(
        &self,
        attribute: &MqttOutputAttribute,
    ) -> Result<MqttMessageCollector, BindingProviderError> {
        let descriptor = self.resolve_descriptor(
            attribute.connection_setting(),
            attribute.connection_factory(),
            None,
            BindingKind::Output,
        )?;
        let connection = self.registry.get_or_create(&descriptor);
        Ok(MqttMessageCollector::new(connection, self.publish_wait))
    }

    pub async fn shutdown(&self) -> DisconnectReport {
        self.registry.disconnect_all().await
    }

    fn resolve_descriptor(
        &self,
        connection_setting: &str,
        factory: Option<&str>,
        binding: Option<&str>,
        kind: BindingKind,
    ) -> Result<ConnectionDescriptor, BindingProviderError> {
        let Some(factory_name) = factory else {
            let raw = resolve_setting(self.resolver.as_ref(), connection_setting)?;
            let name = setting_name(connection_setting);
            return Ok(parse_connection_string(&raw, name)?);
        };

        let factory = self
            .connection_factories
            .get(factory_name)
            .cloned()
            .ok_or_else(|| BindingProviderError::UnknownConnectionFactory {
                factory: factory_name.to_string(),
            })?;

        let context = ConnectionFactoryContext {
            binding: binding.map(str::to_string),
            kind,
            resolver: Arc::clone(&self.resolver),
        };
        let name = setting_name(connection_setting);

        let custom_config = |reason: String| BindingProviderError::CustomConfig {
            factory: factory_name.to_string(),
            reason,
        };

        let descriptor = catch_unwind(AssertUnwindSafe(|| factory(name, &context)))
            .map_err(|panic| custom_config(format!("factory panicked: {}", panic_message(&*panic))))?
            .map_err(|err| custom_config(err.to_string()))?;
        descriptor
            .validate()
            .map_err(|err| custom_config(err.to_string()))?;

        tracing::debug!(
            target: TARGET,
            event = "custom_connection_built",
            factory = %factory_name,
            connection = %descriptor.name()
        );
        Ok(descriptor)
    }
}

impl fmt::Debug for MqttBindingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut factories: Vec<&String> = self.connection_factories.keys().collect();
        factories.sort();
        f.debug_struct("MqttBindingProvider")
            .field("registry", &self.registry)
            .field("connection_factories", &factories)
            .field("publish_wait", &self.publish_wait)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
