//! Wire schemas for the JSON payloads published by the fleet
//!
//! Publishers are not consistent about naming, so every multi-word field
//! accepts both `snake_case` and `camelCase`. Optional fields stay optional
//! here; defaults are applied by the parser. Identifiers may arrive as
//! JSON numbers and are kept as their decimal text.

use serde::{Deserialize, Deserializer, Serialize};

/// Accept an identifier sent either as a string or as a number
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Identifier {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
    }

    Ok(match Identifier::deserialize(deserializer)? {
        Identifier::Text(text) => text,
        Identifier::Signed(n) => n.to_string(),
        Identifier::Unsigned(n) => n.to_string(),
        Identifier::Float(n) => n.to_string(),
    })
}

/// Nested position object `{ "lat": .., "lon": .. }`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WirePosition {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "lng", alias = "longitude")]
    pub lon: f64,
}

/// Payload on `vibus/autobus/{busId}/posizione`
///
/// # Examples
/// ```
/// use vibus_live::protocol::BusPositionWire;
///
/// let wire: BusPositionWire = serde_json::from_str(
///     r#"{"busId":"SVT101","line":"1","latitude":45.55,"longitude":11.55}"#,
/// ).unwrap();
/// assert_eq!(wire.bus_id, "SVT101");
/// assert_eq!(wire.latitude, Some(45.55));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BusPositionWire {
    #[serde(default, alias = "busId", deserialize_with = "string_or_number")]
    pub bus_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub line: String,
    #[serde(default, alias = "lineName")]
    pub line_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<WirePosition>,
    /// Flat alternative to `position`
    #[serde(default, alias = "lat", skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, alias = "lon", alias = "lng", skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default, alias = "heading")]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub passengers: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Payload on `vibus/linea/{lineId}/statistiche`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LineStatisticsWire {
    #[serde(default, deserialize_with = "string_or_number")]
    pub line: String,
    #[serde(default, alias = "activeBuses")]
    pub active_buses: Option<i64>,
    #[serde(default, alias = "averageSpeed")]
    pub average_speed: Option<f64>,
    #[serde(default, alias = "averageDelay")]
    pub average_delay: Option<f64>,
    #[serde(default, alias = "maxDelay")]
    pub max_delay: Option<f64>,
    #[serde(default, alias = "onTimePercentage")]
    pub on_time_percentage: Option<f64>,
    #[serde(default, alias = "totalPassengers")]
    pub total_passengers: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Payload on `vibus/sistema/{component}/stato`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemStatusWire {
    #[serde(default, alias = "totalBuses")]
    pub total_buses: Option<i64>,
    #[serde(default, alias = "activeBuses")]
    pub active_buses: Option<i64>,
    #[serde(default, alias = "totalPassengers")]
    pub total_passengers: Option<i64>,
    #[serde(default, alias = "averageSystemDelay", alias = "average_delay")]
    pub average_system_delay: Option<f64>,
    #[serde(default, alias = "systemHealth")]
    pub system_health: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}
