//! MQTT 3.1.1 connection management for ViBus telemetry
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - connection state, events and client option building
//! - [`reconnect`] - backoff policy and reconnect decisions
//! - [`message_handler`] - routing of rumqttc events
//! - [`client`] - the rumqttc-backed [`Transport`](crate::transport::Transport)
//! - [`manager`] - lifecycle, subscriptions, auto-reconnect and streams
//!
//! # Usage
//!
//! ```rust,no_run
//! use vibus_live::config::{BrokerConfig, LiveConfig};
//! use vibus_live::transport::mqtt::{ConnectionManager, RumqttTransport};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = LiveConfig::for_broker("localhost", 1883);
//! let manager = ConnectionManager::new(Arc::new(RumqttTransport::new()), &config);
//! manager.connect(BrokerConfig::new("localhost", 1883, false)).await?;
//! manager.subscribe("vibus/autobus/+/posizione", rumqttc::QoS::AtLeastOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod manager;
pub mod message_handler;
pub mod reconnect;

pub use client::RumqttTransport;
pub use connection::{
    generate_client_id, ConnectOptions, ConnectionEvent, ConnectionState, ConnectionStats,
    Subscription,
};
pub use manager::{ConnectionManager, ManagerOptions};
pub use message_handler::{EventRoute, MessageHandler};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectDecision};
