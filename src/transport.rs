use crate::error::Result;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};

pub mod client;
pub mod collector;
pub mod listener;
pub mod mqtt;
pub mod runtime;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ListenerState {
    Created,
    Subscribed,
    Stopped,
}

impl Display for ListenerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::Created => f.write_str("created"),
            ListenerState::Subscribed => f.write_str("subscribed"),
            ListenerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Host-facing lifecycle of a trigger listener.
#[async_trait]
pub trait TriggerListener: Send + Sync {
    fn binding(&self) -> &str;
    async fn state(&self) -> ListenerState;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Stops accepting deliveries immediately, then tears down like `stop`.
    async fn cancel(&self) -> Result<()>;
}

pub type DynTriggerListener = Box<dyn TriggerListener>;
