#![forbid(unsafe_code)]

//! Hand-off from a received MQTT message to the host's function runtime.

use crate::domain::{MqttMessage, QualityOfService};
use crate::error::Result;
use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

/// Payload delivered to the executor for one trigger invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerData {
    invocation_id: Uuid,
    binding: String,
    received_at: DateTime<Utc>,
    message: MqttMessage,
}

impl TriggerData {
    pub fn from_message(binding: impl Into<String>, message: MqttMessage) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            binding: binding.into(),
            received_at: Utc::now(),
            message,
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn message(&self) -> &MqttMessage {
        &self.message
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    pub fn payload(&self) -> &Bytes {
        self.message.payload()
    }

    pub fn qos(&self) -> QualityOfService {
        self.message.qos()
    }

    pub fn into_message(self) -> MqttMessage {
        self.message
    }

    /// JSON view handed to runtimes that bind by document rather than by bytes.
    pub fn to_json(&self) -> JsonValue {
        let payload = self.message.payload();
        let mut body = JsonMap::new();
        body.insert(
            "base64".to_string(),
            JsonValue::String(BASE64_STANDARD.encode(payload)),
        );
        if let Ok(text) = std::str::from_utf8(payload) {
            body.insert("text".to_string(), JsonValue::String(text.to_string()));
            if let Ok(parsed) = serde_json::from_str::<JsonValue>(text) {
                body.insert("json".to_string(), parsed);
            }
        }

        json!({
            "invocation_id": self.invocation_id.to_string(),
            "binding": self.binding,
            "received_at": self.received_at.to_rfc3339(),
            "topic": self.message.topic(),
            "qos": self.message.qos().level(),
            "retain": self.message.retain(),
            "payload": JsonValue::Object(body),
        })
    }
}

/// Outcome the executor reports for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionResult {
    succeeded: bool,
    error: Option<String>,
}

impl FunctionResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// The host's function runtime. A returned `Err` means the executor itself failed,
/// as opposed to the function reporting a failure through [`FunctionResult`].
#[async_trait]
pub trait TriggerExecutor: Send + Sync {
    async fn execute(&self, data: TriggerData) -> Result<FunctionResult>;
}
