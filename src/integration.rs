pub mod factory;
pub mod registry;

pub use factory::{
    BindingKind, BindingProviderError, ConnectionFactoryContext, MqttBindingProvider,
    TriggerBinding,
};
pub use registry::{ConnectionRegistry, ConnectionRegistryError, DisconnectReport};
