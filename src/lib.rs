//! ViBus Live
//!
//! Live bus telemetry over MQTT: a resilient connection manager with
//! exponential-backoff reconnect and subscription replay, a tolerant JSON
//! payload parser, and a latest-state cache with staleness eviction.
//!
//! # Overview
//!
//! - [`transport`]: the [`Transport`](transport::Transport) seam, its rumqttc
//!   implementation and the [`ConnectionManager`]
//! - [`processing`]: topic dispatch and payload decoding into the [`domain`] model
//! - [`cache`]: the [`MessageCache`] read by status consumers
//! - [`service`]: [`LiveService`] wiring them together with background tasks
//! - [`observability`]: logging, pipeline metrics, HTTP status server
//!
//! # Quick Start
//!
//! ```rust
//! use vibus_live::domain::{BusStatus, RawMessage};
//! use vibus_live::processing::MessageParser;
//! use vibus_live::MessageCache;
//! use bytes::Bytes;
//!
//! let topic = "vibus/autobus/SVT101/posizione";
//! let payload = Bytes::from_static(
//!     br#"{"bus_id":"SVT101","line":"1","position":{"lat":45.55,"lon":11.55},"delay":1.5}"#,
//! );
//! let raw = RawMessage::from_frame(topic.to_string(), &payload, 1, false).unwrap();
//!
//! let parsed = MessageParser::default().parse(&raw).unwrap();
//! let cache = MessageCache::new();
//! cache.apply(topic, parsed.update);
//!
//! let bus = cache.get_bus("SVT101").unwrap();
//! assert_eq!(bus.delay_minutes, 1.5);
//! assert_eq!(bus.status, BusStatus::InService);
//! ```

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod processing;
pub mod protocol;
pub mod service;
pub mod testing;
pub mod transport;

pub use cache::MessageCache;
pub use config::{BrokerConfig, ConfigError, LiveConfig};
pub use domain::{Bus, BusStatus, GeoPosition, LineStats, ParsedUpdate, SystemHealth, SystemStatus};
pub use error::{MqttError, MqttResult};
pub use service::LiveService;
pub use transport::mqtt::{ConnectionEvent, ConnectionManager, ConnectionState};
