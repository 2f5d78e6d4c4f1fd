//! Broker client abstraction
//!
//! The bridge consumes the inbound broker through two traits:
//! - [`BrokerConnector`] opens a fresh connection for a broker URL
//! - [`BrokerConnection`] yields [`BrokerEvent`]s, takes subscriptions and can be torn down
//!
//! [`MqttConnector`] is the MQTT implementation.

pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use mqtt::{MqttConnection, MqttConnector};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Invalid broker URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },

    #[error("Broker client error: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Events surfaced by a broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Session established (also emitted again after the client's own reconnects)
    Connected,
    /// Subscription acknowledged with the granted QoS / reason codes
    Subscribed { granted: Vec<String> },
    Message { topic: String, payload: Bytes },
    /// Transport or protocol error; the connection keeps retrying on its own
    Error(String),
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send {
    /// Wait for the next event. `None` means the connection is closed for good.
    async fn next_event(&mut self) -> Option<BrokerEvent>;

    /// Request a subscription. The acknowledgement arrives later as
    /// [`BrokerEvent::Subscribed`].
    async fn subscribe(&mut self, topic_pattern: &str) -> Result<()>;

    /// Close the connection. `forced` skips the graceful DISCONNECT handshake.
    async fn disconnect(self: Box<Self>, forced: bool);
}
