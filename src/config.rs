pub mod attribute;
pub mod connection_string;
pub mod resolver;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use attribute::{MqttOutputAttribute, MqttTriggerAttribute};
pub use connection_string::{CertificateSource, ConnectionDescriptor};
pub use resolver::{NameResolver, SettingsNameResolver};

/// Setting name consulted when a binding does not name its connection explicitly.
pub const DEFAULT_CONNECTION_SETTING: &str = "MqttConnection";

/// Publish path: total time spent waiting for a shared connection to report connected.
pub const DEFAULT_PUBLISH_WAIT_BUDGET: Duration = Duration::from_secs(5);
/// Publish path: interval between connected-flag polls.
pub const DEFAULT_PUBLISH_WAIT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("connection `{name}` is missing the required `Server` key")]
    MissingServer { name: String },
    #[error("connection `{name}` has invalid `Port` value `{value}`")]
    InvalidPort { name: String, value: String },
    #[error("connection `{name}` has invalid `Tls` value `{value}`")]
    InvalidTls { name: String, value: String },
    #[error("connection `{name}` has malformed segment `{segment}`")]
    MalformedSegment { name: String, segment: String },
    #[error("setting `{name}` is not configured")]
    MissingSetting { name: String },
    #[error("unterminated `%` placeholder in `{value}`")]
    UnterminatedPlaceholder { value: String },
    #[error("invalid topic filter `{topic}`: {reason}")]
    InvalidTopic { topic: String, reason: String },
    #[error("invalid qos `{value}`")]
    InvalidQos { value: String },
    #[error("trigger binding `{binding}` declares no topics")]
    NoTopics { binding: String },
    #[error("invalid duration `{value}` for `{field}`")]
    InvalidDuration { field: String, value: String },
}

/// Host-level settings layered from `config/local.*` and `MQTT_BINDINGS__*` variables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BindingsConfig {
    /// Application settings consulted by the name resolver (connection strings live here).
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub connection: ConnectionTuning,
    #[serde(default)]
    pub triggers: Vec<TriggerBindingConfig>,
}

impl BindingsConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("MQTT_BINDINGS").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Loads a specific file, still layered under `MQTT_BINDINGS__*` variables.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("MQTT_BINDINGS").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

/// Durations are humantime strings (`"10s"`, `"250ms"`).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionTuning {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial: String,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max: String,
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    #[serde(default = "default_publish_wait_budget")]
    pub publish_wait_budget: String,
    #[serde(default = "default_publish_wait_interval")]
    pub publish_wait_interval: String,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            keep_alive: default_keep_alive(),
            channel_capacity: default_channel_capacity(),
            reconnect_initial: default_reconnect_initial(),
            reconnect_max: default_reconnect_max(),
            reconnect_multiplier: default_reconnect_multiplier(),
            publish_wait_budget: default_publish_wait_budget(),
            publish_wait_interval: default_publish_wait_interval(),
        }
    }
}

/// Parsed, typed view of [`ConnectionTuning`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub channel_capacity: usize,
    pub reconnect: crate::retry::RetrySettings,
    pub publish_wait: ConnectWaitPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            channel_capacity: default_channel_capacity(),
            reconnect: crate::retry::RetrySettings::default(),
            publish_wait: ConnectWaitPolicy::default(),
        }
    }
}

/// Bounded polling budget the publish path uses before attempting a publish anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectWaitPolicy {
    pub budget: Duration,
    pub interval: Duration,
}

impl Default for ConnectWaitPolicy {
    fn default() -> Self {
        Self {
            budget: DEFAULT_PUBLISH_WAIT_BUDGET,
            interval: DEFAULT_PUBLISH_WAIT_INTERVAL,
        }
    }
}

impl ConnectionTuning {
    pub fn options(&self) -> Result<ConnectionOptions, ConfigurationError> {
        let interval = parse_duration_field("publish_wait_interval", &self.publish_wait_interval)?;
        Ok(ConnectionOptions {
            connect_timeout: parse_duration_field("connect_timeout", &self.connect_timeout)?,
            keep_alive: parse_duration_field("keep_alive", &self.keep_alive)?,
            channel_capacity: self.channel_capacity.max(1),
            reconnect: crate::retry::RetrySettings::new(
                parse_duration_field("reconnect_initial", &self.reconnect_initial)?,
                parse_duration_field("reconnect_max", &self.reconnect_max)?,
                self.reconnect_multiplier,
            ),
            publish_wait: ConnectWaitPolicy {
                budget: parse_duration_field("publish_wait_budget", &self.publish_wait_budget)?,
                interval: interval.max(Duration::from_millis(1)),
            },
        })
    }
}

fn parse_duration_field(field: &str, value: &str) -> Result<Duration, ConfigurationError> {
    humantime::parse_duration(value.trim()).map_err(|_| ConfigurationError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// A trigger binding declared in host configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerBindingConfig {
    pub name: String,
    #[serde(default)]
    pub connection: Option<String>,
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub topic: String,
    #[serde(default)]
    pub qos: Option<String>,
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_keep_alive() -> String {
    "30s".to_string()
}

const fn default_channel_capacity() -> usize {
    64
}

fn default_reconnect_initial() -> String {
    "200ms".to_string()
}

fn default_reconnect_max() -> String {
    "5s".to_string()
}

const fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_publish_wait_budget() -> String {
    "5s".to_string()
}

fn default_publish_wait_interval() -> String {
    "50ms".to_string()
}
