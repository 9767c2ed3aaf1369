//! The publish/subscribe link between stations.
//!
//! [`Transport`] is all the rest of the crate knows about it. [`MqttTransport`]
//! talks to a real broker, [`LocalBroker`] hands messages between clients in
//! the same process. Both deliver inbound messages on a thread of their own,
//! never on the thread that publishes.

pub mod local;
pub mod mqtt;

use crate::error::LocatorError;

use std::sync::Arc;

pub use local::{LocalBroker, LocalClient};
pub use mqtt::MqttTransport;

/// Called with the topic and payload of every message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A topic-based message channel.
pub trait Transport: Send + Sync {
    /// Sends `payload` on `topic` and waits until the broker has confirmed
    /// it, or the confirmation timeout runs out. Confirmation means the
    /// broker has the message, not that any peer has seen it.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LocatorError>;

    /// Registers `handler` for messages whose topic matches `filter`. MQTT
    /// wildcards `+` and `#` are understood.
    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), LocatorError>;

    /// False once the link is gone. A lost link is never re-established.
    fn is_connected(&self) -> bool;

    /// Closes the link. Further publishes fail.
    fn disconnect(&self) -> Result<(), LocatorError>;
}

/// Does `topic` match the subscription `filter`?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for pattern in filter.split('/') {
        match (pattern, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (p, Some(level)) if p == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}
