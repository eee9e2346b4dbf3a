#![forbid(unsafe_code)]

//! Value types shared by the connection, listener and collector layers.

use crate::config::ConfigurationError;
use bytes::Bytes;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const SHARED_PREFIX: &str = "$share/";
const QUEUE_PREFIX: &str = "$queue/";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl FromStr for QualityOfService {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return Self::from_level(level).ok_or_else(|| ConfigurationError::InvalidQos {
                value: trimmed.to_string(),
            });
        }

        match trimmed.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "atmostonce" => Ok(Self::AtMostOnce),
            "atleastonce" => Ok(Self::AtLeastOnce),
            "exactlyonce" => Ok(Self::ExactlyOnce),
            _ => Err(ConfigurationError::InvalidQos {
                value: trimmed.to_string(),
            }),
        }
    }
}

impl Display for QualityOfService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AtMostOnce => "at_most_once",
            Self::AtLeastOnce => "at_least_once",
            Self::ExactlyOnce => "exactly_once",
        })
    }
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(value: QualityOfService) -> Self {
        match value {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QualityOfService {
    fn from(value: rumqttc::QoS) -> Self {
        match value {
            rumqttc::QoS::AtMostOnce => QualityOfService::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QualityOfService::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QualityOfService::ExactlyOnce,
        }
    }
}

/// MQTT v5 retain handling subscription option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe,
    SendAtSubscribeIfNew,
    DoNotSend,
}

/// A subscription request: a topic pattern plus delivery options.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    topic: String,
    qos: QualityOfService,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
}

impl TopicFilter {
    pub fn new(
        topic: impl Into<String>,
        qos: QualityOfService,
    ) -> Result<Self, ConfigurationError> {
        let topic = topic.into();
        validate_filter(&topic)?;
        Ok(Self {
            topic,
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::default(),
        })
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.retain_as_published = retain_as_published;
        self
    }

    pub fn with_retain_handling(mut self, retain_handling: RetainHandling) -> Self {
        self.retain_handling = retain_handling;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    pub fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    pub fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    /// Whether a concrete topic name is selected by this filter.
    pub fn matches(&self, topic: &str) -> bool {
        topic_matches(&self.topic, topic)
    }
}

impl Display for TopicFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.topic, self.qos)
    }
}

fn validate_filter(filter: &str) -> Result<(), ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidTopic {
        topic: filter.to_string(),
        reason: reason.to_string(),
    };

    if filter.is_empty() {
        return Err(invalid("topic must not be empty"));
    }

    let levels: Vec<&str> = strip_shared_prefix(filter).split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(invalid("`#` must occupy the whole final level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("`+` must occupy a whole level"));
        }
    }

    Ok(())
}

fn strip_shared_prefix(filter: &str) -> &str {
    if let Some(rest) = filter.strip_prefix(SHARED_PREFIX) {
        return rest.split_once('/').map(|(_, topic)| topic).unwrap_or(rest);
    }
    filter.strip_prefix(QUEUE_PREFIX).unwrap_or(filter)
}

/// Matches a topic name against a filter using `+`/`#` wildcard rules.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter = strip_shared_prefix(filter);

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// An MQTT application message, inbound or outbound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttMessage {
    topic: String,
    payload: Bytes,
    qos: QualityOfService,
    retain: bool,
}

impl MqttMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QualityOfService,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Payload decoded as UTF-8, if it is valid text.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
