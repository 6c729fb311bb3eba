//! Pure connection state management for the MQTT client
//!
//! This module contains the connection state machine values, the events
//! broadcast on every transition, and rumqttc option construction.

use crate::config::BrokerConfig;
use chrono::{DateTime, Utc};
use rumqttc::{MqttOptions, QoS, Transport as RumqttcTransport};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Connection state of a [`ConnectionManager`](super::ConnectionManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Last attempt failed or the session was lost
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Broadcast on every state transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub message: String,
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Backoff delay before the next attempt, set on `Reconnecting`
    #[serde(skip_serializing_if = "Option::is_none", with = "duration_ms")]
    pub reconnect_delay: Option<Duration>,
}

impl ConnectionEvent {
    pub fn new<S: Into<String>>(state: ConnectionState, message: S) -> Self {
        Self {
            state,
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
            reconnect_delay: None,
        }
    }

    pub fn with_cause<S: Into<String>>(mut self, cause: S) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(delay) => serializer.serialize_u64(delay.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }
}

/// A registered topic filter
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    /// False while the session that carried it is gone
    pub active: bool,
}

/// Observational snapshot of a manager's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub connected: bool,
    pub uptime_ms: u64,
    pub messages_received: u64,
    pub messages_lost: u64,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
    pub broker_host: String,
    pub client_id: String,
}

/// Parameters of one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub broker: BrokerConfig,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
}

/// Generate a fresh client identifier: `<prefix>_<8 hex digits>`
pub fn generate_client_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &random[..8])
}

/// Pure function to configure rumqttc options for one attempt
pub fn configure_mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let broker = &options.broker;
    let mut mqtt_options = MqttOptions::new(&options.client_id, &broker.host, broker.port);

    if broker.use_ssl {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &broker.username {
        let password = broker.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    // rumqttc rejects sub-second keep-alive intervals other than zero
    let keep_alive = if options.keep_alive < Duration::from_secs(1) {
        Duration::ZERO
    } else {
        options.keep_alive
    };
    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_clean_session(options.clean_session);

    mqtt_options
}
