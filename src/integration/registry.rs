#![forbid(unsafe_code)]

//! Process-wide pool of MQTT connections keyed by logical connection name.

use crate::config::ConnectionDescriptor;
use crate::retry::RetrySettings;
use crate::transport::client::MqttClientFactory;
use crate::transport::mqtt::{MqttConnection, MqttConnectionError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const TARGET: &str = "mqtt_bindings::registry";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionRegistryError {
    #[error(
        "connection `{connection}` is already used by trigger `{existing_binding}`; \
         trigger `{binding}` must use a different connection"
    )]
    DuplicateConnection {
        connection: String,
        existing_binding: String,
        binding: String,
    },
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, Arc<MqttConnection>>,
    trigger_claims: HashMap<String, String>,
}

/// Outcome of [`ConnectionRegistry::disconnect_all`].
#[derive(Debug, Default)]
pub struct DisconnectReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, MqttConnectionError)>,
}

impl DisconnectReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ConnectionRegistry {
    client_factory: Arc<dyn MqttClientFactory>,
    reconnect: RetrySettings,
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(client_factory: Arc<dyn MqttClientFactory>, reconnect: RetrySettings) -> Self {
        Self {
            client_factory,
            reconnect,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Returns the connection registered under the descriptor's name, creating it on
    /// first use. Lookup and insertion happen under one lock.
    pub fn get_or_create(&self, descriptor: &ConnectionDescriptor) -> Arc<MqttConnection> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.get_or_insert(&mut state, descriptor)
    }

    /// Like [`get_or_create`](Self::get_or_create), but records `binding` as the only
    /// trigger allowed to receive on this connection. Any later trigger claim on the
    /// same name fails, including one carrying the same binding name.
    pub fn get_or_create_for_trigger(
        &self,
        binding: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<MqttConnection>, ConnectionRegistryError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = state.trigger_claims.get(descriptor.name()) {
            tracing::error!(
                target: TARGET,
                event = "duplicate_trigger_connection",
                connection = %descriptor.name(),
                existing_binding = %existing,
                binding = %binding
            );
            return Err(ConnectionRegistryError::DuplicateConnection {
                connection: descriptor.name().to_string(),
                existing_binding: existing.clone(),
                binding: binding.to_string(),
            });
        }

        state
            .trigger_claims
            .insert(descriptor.name().to_string(), binding.to_string());
        Ok(self.get_or_insert(&mut state, descriptor))
    }

    fn get_or_insert(
        &self,
        state: &mut RegistryState,
        descriptor: &ConnectionDescriptor,
    ) -> Arc<MqttConnection> {
        if let Some(connection) = state.connections.get(descriptor.name()) {
            if connection.descriptor() != descriptor {
                tracing::warn!(
                    target: TARGET,
                    event = "descriptor_mismatch",
                    connection = %descriptor.name(),
                    "connection already registered with different settings; reusing the first"
                );
            }
            return Arc::clone(connection);
        }

        let connection = Arc::new(MqttConnection::new(
            descriptor.clone(),
            Arc::clone(&self.client_factory),
            self.reconnect.clone(),
        ));
        state
            .connections
            .insert(descriptor.name().to_string(), Arc::clone(&connection));
        tracing::debug!(
            target: TARGET,
            event = "connection_registered",
            connection = %descriptor.name()
        );
        connection
    }

    pub fn get(&self, name: &str) -> Option<Arc<MqttConnection>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = state.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every registered connection. A failing connection is logged and the
    /// remaining ones are still stopped.
    pub async fn disconnect_all(&self) -> DisconnectReport {
        let connections: Vec<Arc<MqttConnection>> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.connections.values().cloned().collect()
        };

        let mut report = DisconnectReport::default();
        for connection in connections {
            match connection.stop().await {
                Ok(()) => report.stopped.push(connection.name().to_string()),
                Err(err) => {
                    tracing::warn!(
                        target: TARGET,
                        event = "disconnect_failed",
                        connection = %connection.name(),
                        error = %err
                    );
                    report.failed.push((connection.name().to_string(), err));
                }
            }
        }

        tracing::info!(
            target: TARGET,
            event = "disconnect_all_completed",
            stopped = report.stopped.len(),
            failed = report.failed.len()
        );
        report
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.names())
            .finish()
    }
}
