//! Transport layer for broker communication
//!
//! This module provides the transport abstraction consumed by the
//! [`ConnectionManager`](mqtt::ConnectionManager) and its rumqttc implementation.

use crate::error::MqttResult;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::connection::ConnectOptions;

/// Events pushed by a transport into the manager's ingestion path
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Application message on a subscribed topic
    Message {
        topic: String,
        payload: Bytes,
        qos: u8,
        retain: bool,
    },
    /// The session ended without a local disconnect
    ConnectionLost(String),
}

/// Transport trait for broker communication
///
/// This trait provides an abstraction over the MQTT client library to
/// enable dependency injection and broker-free testing. One `connect`
/// establishes one session; the manager creates a new session per attempt.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the handshake. Returns once the broker acknowledged the session.
    /// Inbound traffic of the session is delivered on `inbound`.
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: mpsc::Sender<TransportEvent>,
    ) -> MqttResult<()>;

    /// Close the current session. No-op when there is none.
    async fn disconnect(&self) -> MqttResult<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()>;

    /// Unsubscribe from a topic filter
    async fn unsubscribe(&self, topic: &str) -> MqttResult<()>;

    /// Check if a session is currently established
    fn is_connected(&self) -> bool;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::RumqttTransport;
