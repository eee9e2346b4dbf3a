//! Binding attributes as the host hands them over after its own discovery.

use super::{ConfigurationError, TriggerBindingConfig, DEFAULT_CONNECTION_SETTING};
use crate::domain::{QualityOfService, TopicFilter};

/// Trigger binding: which connection to use and which topics to subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTriggerAttribute {
    name: String,
    connection_setting: String,
    topics: Vec<(String, QualityOfService)>,
    connection_factory: Option<String>,
}

impl MqttTriggerAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_setting: DEFAULT_CONNECTION_SETTING.to_string(),
            topics: Vec::new(),
            connection_factory: None,
        }
    }

    pub fn with_connection(mut self, setting: impl Into<String>) -> Self {
        self.connection_setting = setting.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>, qos: QualityOfService) -> Self {
        self.topics.push((topic.into(), qos));
        self
    }

    /// Name of a registered custom connection factory to use instead of the setting.
    pub fn with_connection_factory(mut self, factory: impl Into<String>) -> Self {
        self.connection_factory = Some(factory.into());
        self
    }

    pub fn from_config(config: &TriggerBindingConfig) -> Result<Self, ConfigurationError> {
        let mut attribute = Self::new(config.name.clone());
        if let Some(connection) = config.connection.as_deref() {
            attribute = attribute.with_connection(connection);
        }
        for topic in &config.topics {
            let qos = match topic.qos.as_deref() {
                Some(raw) => raw.parse::<QualityOfService>()?,
                None => QualityOfService::default(),
            };
            attribute = attribute.with_topic(topic.topic.clone(), qos);
        }
        Ok(attribute)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_setting(&self) -> &str {
        &self.connection_setting
    }

    pub fn connection_factory(&self) -> Option<&str> {
        self.connection_factory.as_deref()
    }

    pub fn raw_topics(&self) -> &[(String, QualityOfService)] {
        &self.topics
    }

    /// Builds filters after `%placeholder%` expansion by `expand`.
    pub fn topic_filters<F>(&self, mut expand: F) -> Result<Vec<TopicFilter>, ConfigurationError>
    where
        F: FnMut(&str) -> Result<String, ConfigurationError>,
    {
        if self.topics.is_empty() {
            return Err(ConfigurationError::NoTopics {
                binding: self.name.clone(),
            });
        }

        self.topics
            .iter()
            .map(|(topic, qos)| TopicFilter::new(expand(topic)?, *qos))
            .collect()
    }
}

/// Output binding: which connection publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOutputAttribute {
    connection_setting: String,
    connection_factory: Option<String>,
}

impl MqttOutputAttribute {
    pub fn new() -> Self {
        Self {
            connection_setting: DEFAULT_CONNECTION_SETTING.to_string(),
            connection_factory: None,
        }
    }

    pub fn with_connection(mut self, setting: impl Into<String>) -> Self {
        self.connection_setting = setting.into();
        self
    }

    pub fn with_connection_factory(mut self, factory: impl Into<String>) -> Self {
        self.connection_factory = Some(factory.into());
        self
    }

    pub fn connection_setting(&self) -> &str {
        &self.connection_setting
    }

    pub fn connection_factory(&self) -> Option<&str> {
        self.connection_factory.as_deref()
    }
}

impl Default for MqttOutputAttribute {
    fn default() -> Self {
        Self::new()
    }
}
