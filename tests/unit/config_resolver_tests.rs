use mqtt_bindings::config::resolver::{resolve_placeholders, resolve_setting, setting_name};
use mqtt_bindings::config::{
    BindingsConfig, ConfigurationError, MqttTriggerAttribute, NameResolver, SettingsNameResolver,
};
use mqtt_bindings::domain::QualityOfService;
use std::collections::HashMap;
use std::io::Write;

fn resolver(pairs: &[(&str, &str)]) -> SettingsNameResolver {
    let settings: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    SettingsNameResolver::isolated(settings)
}

#[test]
fn placeholders_expand_from_settings() {
    let resolver = resolver(&[("Site", "plant-7"), ("Kind", "temp")]);
    let expanded =
        resolve_placeholders(&resolver, "sensors/%Site%/%Kind%").expect("placeholders resolve");
    assert_eq!(expanded, "sensors/plant-7/temp");
}

#[test]
fn double_percent_is_literal() {
    let resolver = resolver(&[]);
    assert_eq!(
        resolve_placeholders(&resolver, "load/100%%").expect("literal"),
        "load/100%"
    );
}

#[test]
fn placeholder_errors_name_the_problem() {
    let resolver = resolver(&[]);
    assert_eq!(
        resolve_placeholders(&resolver, "a/%Missing%/b"),
        Err(ConfigurationError::MissingSetting {
            name: "Missing".to_string()
        })
    );
    assert!(matches!(
        resolve_placeholders(&resolver, "a/%open"),
        Err(ConfigurationError::UnterminatedPlaceholder { .. })
    ));
}

#[test]
fn setting_references_accept_bare_and_wrapped_names() {
    let resolver = resolver(&[("MqttConnection", "Server=localhost")]);
    assert_eq!(setting_name(" %MqttConnection% "), "MqttConnection");
    assert_eq!(
        resolve_setting(&resolver, "%MqttConnection%").as_deref(),
        Ok("Server=localhost")
    );
    assert_eq!(
        resolve_setting(&resolver, "mqttconnection").as_deref(),
        Ok("Server=localhost")
    );
    assert!(matches!(
        resolve_setting(&resolver, "Other"),
        Err(ConfigurationError::MissingSetting { name }) if name == "Other"
    ));
}

#[test]
fn trigger_attribute_expands_topics_and_validates_them() {
    let resolver = resolver(&[("Room", "kitchen")]);
    let attribute = MqttTriggerAttribute::new("temperature")
        .with_topic("home/%Room%/temp", QualityOfService::AtLeastOnce)
        .with_topic("home/+/alarm", QualityOfService::ExactlyOnce);

    let filters = attribute
        .topic_filters(|topic| resolve_placeholders(&resolver, topic))
        .expect("filters");
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[0].topic(), "home/kitchen/temp");
    assert_eq!(filters[1].qos(), QualityOfService::ExactlyOnce);

    let invalid = MqttTriggerAttribute::new("bad").with_topic("home/#/x", QualityOfService::AtMostOnce);
    assert!(matches!(
        invalid.topic_filters(|topic| Ok(topic.to_string())),
        Err(ConfigurationError::InvalidTopic { .. })
    ));

    let empty = MqttTriggerAttribute::new("empty");
    assert_eq!(
        empty.topic_filters(|topic| Ok(topic.to_string())),
        Err(ConfigurationError::NoTopics {
            binding: "empty".to_string()
        })
    );
}

#[test]
fn bindings_config_loads_from_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    writeln!(
        file,
        r#"
[settings]
Broker = "Server=broker.test;Port=1884"

[[triggers]]
name = "alarms"
connection = "Broker"
topics = [{{ topic = "alarms/#", qos = "exactly_once" }}]
"#
    )
    .expect("write config");

    let config = BindingsConfig::from_path(file.path()).expect("config loads");
    let attribute = MqttTriggerAttribute::from_config(&config.triggers[0]).expect("attribute");
    assert_eq!(attribute.connection_setting(), "Broker");
    assert_eq!(
        attribute.raw_topics(),
        &[("alarms/#".to_string(), QualityOfService::ExactlyOnce)]
    );

    let resolver = SettingsNameResolver::isolated(config.settings);
    assert_eq!(
        resolver.resolve("Broker").as_deref(),
        Some("Server=broker.test;Port=1884")
    );
}
