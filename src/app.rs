use crate::config::{
    BindingsConfig, MqttTriggerAttribute, NameResolver, SettingsNameResolver,
};
use crate::error::{Context, Result};
use crate::executor::TriggerExecutor;
use crate::integration::{ConnectionRegistry, MqttBindingProvider};
use crate::transport::client::{MqttClientFactory, RumqttcClientFactory};
use crate::transport::DynTriggerListener;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Owns the trigger listeners declared in configuration and the provider that built
/// them. Output bindings are created from [`BindingHost::provider`].
pub struct BindingHost {
    provider: Arc<MqttBindingProvider>,
    listeners: Vec<DynTriggerListener>,
    shutdown: CancellationToken,
}

impl BindingHost {
    pub fn initialise(config: BindingsConfig, executor: Arc<dyn TriggerExecutor>) -> Result<Self> {
        let options = config
            .connection
            .options()
            .context("invalid connection tuning")?;
        let client_factory: Arc<dyn MqttClientFactory> =
            Arc::new(RumqttcClientFactory::new(options));
        Self::build_with(config, executor, client_factory)
    }

    /// Builds the host on a caller-supplied client factory. All binding errors
    /// surface here, before anything connects.
    pub fn build_with(
        config: BindingsConfig,
        executor: Arc<dyn TriggerExecutor>,
        client_factory: Arc<dyn MqttClientFactory>,
    ) -> Result<Self> {
        let options = config
            .connection
            .options()
            .context("invalid connection tuning")?;
        let resolver: Arc<dyn NameResolver> =
            Arc::new(SettingsNameResolver::new(config.settings.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            client_factory,
            options.reconnect.clone(),
        ));
        let provider = Arc::new(
            MqttBindingProvider::new(registry, resolver).with_publish_wait(options.publish_wait),
        );

        let mut names = HashSet::with_capacity(config.triggers.len());
        let mut listeners: Vec<DynTriggerListener> = Vec::with_capacity(config.triggers.len());
        for trigger in &config.triggers {
            if !names.insert(trigger.name.as_str()) {
                crate::bail_err!(
                    "trigger binding `{}` is configured more than once",
                    trigger.name
                );
            }
            let attribute = MqttTriggerAttribute::from_config(trigger)
                .with_context(|| format!("invalid trigger binding `{}`", trigger.name))?;
            let listener = provider
                .create_listener(&attribute, Arc::clone(&executor))
                .with_context(|| format!("failed to bind trigger `{}`", trigger.name))?;
            listeners.push(Box::new(listener));
        }

        tracing::info!(
            target: "mqtt_bindings::app",
            event = "host_initialised",
            triggers = listeners.len(),
            connections = provider.registry().len()
        );

        Ok(Self {
            provider,
            listeners,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn provider(&self) -> &Arc<MqttBindingProvider> {
        &self.provider
    }

    pub fn listeners(&self) -> &[DynTriggerListener] {
        &self.listeners
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts every listener. If one fails, the ones already started are stopped
    /// again and the failure is returned.
    pub async fn start(&self) -> Result<()> {
        for (index, listener) in self.listeners.iter().enumerate() {
            if let Err(err) = listener.start().await {
                for started in &self.listeners[..index] {
                    if let Err(stop_err) = started.stop().await {
                        tracing::warn!(
                            target: "mqtt_bindings::app",
                            event = "listener_rollback_failed",
                            binding = %started.binding(),
                            error = %stop_err
                        );
                    }
                }
                return Err(err)
                    .with_context(|| format!("failed to start trigger `{}`", listener.binding()));
            }
        }
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.start().await?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("shutdown requested");
            }
        }

        self.shutdown().await
    }

    /// Stops listeners, then every pooled connection. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        for listener in &self.listeners {
            if let Err(err) = listener.stop().await {
                tracing::warn!(
                    target: "mqtt_bindings::app",
                    event = "listener_stop_failed",
                    binding = %listener.binding(),
                    error = %err
                );
            }
        }

        let report = self.provider.shutdown().await;
        if !report.is_clean() {
            tracing::warn!(
                target: "mqtt_bindings::app",
                event = "shutdown_incomplete",
                failed = report.failed.len()
            );
        }
        Ok(())
    }
}
