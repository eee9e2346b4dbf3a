#![allow(clippy::result_large_err)]

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod integration;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub mod transport;

pub use config::{MqttOutputAttribute, MqttTriggerAttribute};
pub use domain::{MqttMessage, QualityOfService, TopicFilter};
pub use executor::{FunctionResult, TriggerData, TriggerExecutor};
pub use integration::MqttBindingProvider;
