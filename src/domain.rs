//! Domain model exchanged between the connection manager, the parser and the cache
//!
//! These are the validated, typed records. Wire representations live in
//! [`crate::protocol::messages`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Geographic position in decimal degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPosition {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPosition {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether the coordinates are on the globe at all
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Operational status of a single bus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BusStatus {
    InService,
    OutOfService,
    Maintenance,
    Delayed,
}

impl BusStatus {
    /// Map a wire status string, tolerating case, separators and synonyms.
    /// Returns `None` for unrecognised values; callers decide the fallback.
    pub fn from_wire(value: &str) -> Option<Self> {
        match normalize_token(value).as_str() {
            "in_service" | "inservice" | "active" | "running" | "operating" | "on_route" => {
                Some(Self::InService)
            }
            "out_of_service" | "outofservice" | "stopped" | "inactive" | "offline" | "parked" => {
                Some(Self::OutOfService)
            }
            "maintenance" | "in_maintenance" | "repair" | "repairing" | "broken" => {
                Some(Self::Maintenance)
            }
            "delayed" | "late" | "behind_schedule" => Some(Self::Delayed),
            _ => None,
        }
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InService => "in_service",
            Self::OutOfService => "out_of_service",
            Self::Maintenance => "maintenance",
            Self::Delayed => "delayed",
        };
        f.write_str(label)
    }
}

/// Overall health of the transit network
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl SystemHealth {
    /// Map a wire health string, tolerating case and synonyms.
    pub fn from_wire(value: &str) -> Option<Self> {
        match normalize_token(value).as_str() {
            "excellent" | "optimal" | "perfect" => Some(Self::Excellent),
            "good" | "ok" | "normal" | "healthy" => Some(Self::Good),
            "fair" | "degraded" | "warning" | "average" => Some(Self::Fair),
            "poor" | "bad" | "unhealthy" => Some(Self::Poor),
            "critical" | "down" | "failure" | "emergency" => Some(Self::Critical),
            _ => None,
        }
    }
}

fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .replace(|c: char| c == '-' || c == ' ', "_")
}

/// A bus and its last reported telemetry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bus {
    pub id: String,
    pub line: String,
    pub line_name: String,
    pub position: GeoPosition,
    pub speed_kmh: f64,
    pub bearing_deg: u16,
    /// Signed; negative means ahead of schedule
    pub delay_minutes: f64,
    pub passengers: u32,
    pub status: BusStatus,
    pub last_update: DateTime<Utc>,
}

/// Aggregated statistics for one line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineStats {
    pub line: String,
    pub active_buses: u32,
    pub average_speed_kmh: f64,
    pub average_delay_minutes: f64,
    pub max_delay_minutes: f64,
    pub on_time_percentage: f64,
    pub total_passengers: u32,
    pub last_update: DateTime<Utc>,
}

/// Network-wide status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatus {
    pub total_buses: u32,
    pub active_buses: u32,
    pub total_passengers: u32,
    pub average_system_delay_minutes: f64,
    pub system_health: SystemHealth,
    pub last_update: DateTime<Utc>,
}

/// A successfully decoded telemetry update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ParsedUpdate {
    BusPosition(Bus),
    LineStatistics(LineStats),
    SystemStatus(SystemStatus),
}

impl ParsedUpdate {
    /// Timestamp carried by the update
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::BusPosition(bus) => bus.last_update,
            Self::LineStatistics(stats) => stats.last_update,
            Self::SystemStatus(status) => status.last_update,
        }
    }

    /// Natural key of the entity the update refers to
    pub fn entity_key(&self) -> String {
        match self {
            Self::BusPosition(bus) => format!("bus:{}", bus.id),
            Self::LineStatistics(stats) => format!("line:{}", stats.line),
            Self::SystemStatus(_) => "system".to_string(),
        }
    }
}

/// An inbound message as handed over by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retained: bool,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Decode a transport frame. Fails when the payload is not UTF-8.
    pub fn from_frame(
        topic: String,
        payload: &Bytes,
        qos: u8,
        retained: bool,
    ) -> Result<Self, std::str::Utf8Error> {
        let payload = std::str::from_utf8(payload)?.to_string();
        Ok(Self {
            topic,
            payload,
            qos,
            retained,
            received_at: Utc::now(),
        })
    }
}
