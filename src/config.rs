//! Configuration for the live telemetry service
//!
//! Loaded from a TOML file. Credentials are never stored in the file; the
//! `[broker]` section names the environment variables that hold them.

use crate::protocol::topics::{default_subscriptions, qos_from_u8, qos_to_u8, validate_topic_filter};
use crate::transport::mqtt::ReconnectConfig;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub channels: ChannelSection,
    #[serde(default)]
    pub parser: ParserSection,
    #[serde(default)]
    pub http: HttpSection,
    /// Overrides the default topic set when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<Vec<SubscriptionEntry>>,
}

/// Broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker host name; may be omitted when `url` is set
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    /// Full broker URL (`tcp://`, `mqtt://`, `ssl://`, `mqtts://`), overrides host/port/use_ssl
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Environment variable containing the username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable containing the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "vibus".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

/// Auto-reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

/// Staleness policy of the message cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_max_age() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Buffer sizes of the broadcast streams (oldest entries are dropped on overflow)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSection {
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            message_buffer: default_message_buffer(),
        }
    }
}

fn default_event_buffer() -> usize {
    10
}

fn default_message_buffer() -> usize {
    50
}

/// Parser policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ParserSection {
    /// Reject messages that fail the bounds validators instead of only warning
    #[serde(default)]
    pub strict_validation: bool,
    #[serde(default)]
    pub bounds: BoundsSection,
}

/// Plausibility bounds used by the advisory validators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundsSection {
    #[serde(default = "default_min_lat")]
    pub min_lat: f64,
    #[serde(default = "default_max_lat")]
    pub max_lat: f64,
    #[serde(default = "default_min_lon")]
    pub min_lon: f64,
    #[serde(default = "default_max_lon")]
    pub max_lon: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed_kmh: f64,
    #[serde(default = "default_max_passengers")]
    pub max_passengers: u32,
}

impl Default for BoundsSection {
    fn default() -> Self {
        Self {
            min_lat: default_min_lat(),
            max_lat: default_max_lat(),
            min_lon: default_min_lon(),
            max_lon: default_max_lon(),
            max_speed_kmh: default_max_speed(),
            max_passengers: default_max_passengers(),
        }
    }
}

// Vicenza service area
fn default_min_lat() -> f64 {
    45.40
}

fn default_max_lat() -> f64 {
    45.65
}

fn default_min_lon() -> f64 {
    11.40
}

fn default_max_lon() -> f64 {
    11.70
}

fn default_max_speed() -> f64 {
    100.0
}

fn default_max_passengers() -> u32 {
    80
}

/// Read-only HTTP status server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_http_port(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

/// One entry of the `[[subscriptions]]` override list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    pub topic: String,
    #[serde(default = "default_subscription_qos")]
    pub qos: u8,
}

fn default_subscription_qos() -> u8 {
    1
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Immutable connection parameters for one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn new<S: Into<String>>(host: S, port: u16, use_ssl: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_ssl,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `ssl://host:port` or `tcp://host:port`
    pub fn broker_url(&self) -> String {
        let scheme = if self.use_ssl { "ssl" } else { "tcp" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Parse a broker URL such as `ssl://broker.example.org:8883`
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
        let use_ssl = match url.scheme() {
            "ssl" | "mqtts" => true,
            "tcp" | "mqtt" => false,
            _ => return Err(ConfigError::InvalidBrokerUrl(raw.to_string())),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
        let port = url.port().unwrap_or(if use_ssl { 8883 } else { 1883 });

        let mut config = Self::new(host, port, use_ssl);
        if !url.username().is_empty() {
            config.username = Some(url.username().to_string());
            config.password = url.password().map(str::to_string);
        }
        Ok(config)
    }
}

impl LiveConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LiveConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration pointing at `host:port` with every default applied
    pub fn for_broker<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            broker: BrokerSection {
                host: host.into(),
                port,
                use_ssl: false,
                url: None,
                username_env: None,
                password_env: None,
                client_id_prefix: default_client_id_prefix(),
                keep_alive_secs: default_keep_alive(),
                clean_session: default_clean_session(),
                connect_timeout_secs: default_connect_timeout(),
            },
            reconnect: ReconnectSection::default(),
            cache: CacheSection::default(),
            channels: ChannelSection::default(),
            parser: ParserSection::default(),
            http: HttpSection::default(),
            subscriptions: None,
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.broker.url {
            Some(url) => {
                BrokerConfig::from_url(url)?;
            }
            None => {
                if self.broker.host.trim().is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "broker.host (or broker.url) is required".to_string(),
                    ));
                }
                if self.broker.port == 0 {
                    return Err(ConfigError::InvalidConfig(
                        "broker.port must be greater than 0".to_string(),
                    ));
                }
            }
        }

        if self.broker.client_id_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.client_id_prefix cannot be empty".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect.max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.reconnect.max_delay_ms, self.reconnect.base_delay_ms
            )));
        }
        if self.channels.event_buffer == 0 || self.channels.message_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "channel buffers must be greater than 0".to_string(),
            ));
        }
        if self.cache.max_age_secs == 0 || self.cache.cleanup_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "cache.max_age_secs and cache.cleanup_interval_secs must be greater than 0"
                    .to_string(),
            ));
        }

        let bounds = &self.parser.bounds;
        if bounds.min_lat >= bounds.max_lat || bounds.min_lon >= bounds.max_lon {
            return Err(ConfigError::InvalidConfig(
                "parser.bounds must describe a non-empty area".to_string(),
            ));
        }

        if let Some(entries) = &self.subscriptions {
            for entry in entries {
                validate_topic_filter(&entry.topic).map_err(|e| {
                    ConfigError::InvalidConfig(format!("subscription '{}': {e}", entry.topic))
                })?;
                if qos_from_u8(entry.qos).is_none() {
                    return Err(ConfigError::InvalidConfig(format!(
                        "subscription '{}': qos must be 0, 1 or 2",
                        entry.topic
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve the broker parameters, reading credentials from the environment
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        let mut config = match &self.broker.url {
            Some(url) => BrokerConfig::from_url(url)?,
            None => BrokerConfig::new(&self.broker.host, self.broker.port, self.broker.use_ssl),
        };

        if let Some(username) = Self::get_env_var_optional(self.broker.username_env.as_ref()) {
            config.username = Some(username);
            config.password = Self::get_env_var_optional(self.broker.password_env.as_ref());
        }

        Ok(config)
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Reconnect policy derived from `[reconnect]`
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            auto_reconnect: self.reconnect.auto_reconnect,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    /// Topics the service keeps subscribed
    pub fn subscription_set(&self) -> Vec<(String, QoS)> {
        match &self.subscriptions {
            Some(entries) => entries
                .iter()
                .filter_map(|entry| qos_from_u8(entry.qos).map(|qos| (entry.topic.clone(), qos)))
                .collect(),
            None => default_subscriptions(),
        }
    }

    /// Subscription entries in their serialisable form
    pub fn subscription_entries(&self) -> Vec<SubscriptionEntry> {
        self.subscription_set()
            .into_iter()
            .map(|(topic, qos)| SubscriptionEntry {
                topic,
                qos: qos_to_u8(qos),
            })
            .collect()
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache.max_age_secs)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker.keep_alive_secs)
    }
}
