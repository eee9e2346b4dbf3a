#![allow(clippy::result_large_err)]

use anyhow::Context;
use async_trait::async_trait;
use mqtt_bindings::app::BindingHost;
use mqtt_bindings::config::BindingsConfig;
use mqtt_bindings::executor::{FunctionResult, TriggerData, TriggerExecutor};
use mqtt_bindings::telemetry;
use std::sync::Arc;

/// Stand-in function runtime: logs every invocation it receives.
struct LoggingExecutor;

#[async_trait]
impl TriggerExecutor for LoggingExecutor {
    async fn execute(&self, data: TriggerData) -> mqtt_bindings::error::Result<FunctionResult> {
        tracing::info!(
            target: "mqtt_bindings::executor",
            event = "trigger_invoked",
            binding = %data.binding(),
            topic = %data.topic(),
            payload = %data.to_json()["payload"]
        );
        Ok(FunctionResult::success())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    let config = BindingsConfig::load().context("failed to load configuration")?;
    if config.triggers.is_empty() {
        tracing::warn!("no trigger bindings configured; waiting for shutdown signal");
    }

    let host = BindingHost::initialise(config, Arc::new(LoggingExecutor))
        .context("failed to construct binding host")?;

    host.run().await.context("binding host runtime error")
}
