//! Message parser: raw broker messages to typed updates
//!
//! Classification is by topic; decoding is permissive about optional
//! fields. Every failure is returned as
//! [`MqttError::MessageParsingFailed`] and never panics.

use super::timestamps::{resolve_timestamp, Timestamp};
use super::validation::{is_passenger_count_plausible, is_position_in_bounds, is_speed_plausible};
use crate::config::{BoundsSection, ParserSection};
use crate::domain::{
    Bus, BusStatus, GeoPosition, LineStats, ParsedUpdate, RawMessage, SystemHealth, SystemStatus,
};
use crate::error::{MqttError, MqttResult};
use crate::protocol::messages::{BusPositionWire, LineStatisticsWire, SystemStatusWire};
use crate::protocol::topics::TopicKind;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{debug, warn};

/// Average speed assumed when a line report omits it
pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 25.0;

/// Tolerated irregularity in an accepted message
#[derive(Debug, Clone, PartialEq)]
pub enum ParseWarning {
    /// Unrecognised bus status, mapped to in-service
    UnknownBusStatus(String),
    /// Unrecognised health value, mapped to good
    UnknownSystemHealth(String),
    /// Unparsable timestamp, replaced by the receive time
    InvalidTimestamp(String),
    PositionOutOfBounds { lat: f64, lon: f64 },
    SpeedOutOfRange(f64),
    PassengersOutOfRange(i64),
}

impl ParseWarning {
    /// Validator hits, as opposed to tolerant-decoding fallbacks
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PositionOutOfBounds { .. } | Self::SpeedOutOfRange(_) | Self::PassengersOutOfRange(_)
        )
    }
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBusStatus(value) => write!(f, "unknown bus status '{value}'"),
            Self::UnknownSystemHealth(value) => write!(f, "unknown system health '{value}'"),
            Self::InvalidTimestamp(value) => write!(f, "unparsable timestamp '{value}'"),
            Self::PositionOutOfBounds { lat, lon } => {
                write!(f, "position ({lat}, {lon}) outside service area")
            }
            Self::SpeedOutOfRange(speed) => write!(f, "speed {speed} km/h out of range"),
            Self::PassengersOutOfRange(count) => write!(f, "passenger count {count} out of range"),
        }
    }
}

/// A decoded update plus the fallbacks applied to it
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub kind: TopicKind,
    pub update: ParsedUpdate,
    pub warnings: Vec<ParseWarning>,
}

/// Converts [`RawMessage`]s into [`ParsedUpdate`]s
#[derive(Debug, Clone, Default)]
pub struct MessageParser {
    strict_validation: bool,
    bounds: BoundsSection,
}

impl MessageParser {
    pub fn new(config: &ParserSection) -> Self {
        Self {
            strict_validation: config.strict_validation,
            bounds: config.bounds.clone(),
        }
    }

    /// Classify and decode one message
    pub fn parse(&self, raw: &RawMessage) -> MqttResult<ParsedMessage> {
        let kind = TopicKind::classify(&raw.topic).ok_or_else(|| {
            MqttError::parsing_failed(&raw.topic, &raw.payload, "unknown topic pattern")
        })?;

        let mut warnings = Vec::new();
        let update = match kind {
            TopicKind::BusPosition => {
                ParsedUpdate::BusPosition(self.parse_bus_position(raw, &mut warnings)?)
            }
            TopicKind::LineStatistics => {
                ParsedUpdate::LineStatistics(self.parse_line_statistics(raw, &mut warnings)?)
            }
            TopicKind::SystemStatus => {
                ParsedUpdate::SystemStatus(self.parse_system_status(raw, &mut warnings)?)
            }
        };

        if self.strict_validation {
            if let Some(violation) = warnings.iter().find(|w| w.is_validation()) {
                return Err(MqttError::parsing_failed(
                    &raw.topic,
                    &raw.payload,
                    violation.to_string(),
                ));
            }
        }

        for warning in &warnings {
            warn!(topic = %raw.topic, "{}", warning);
        }
        debug!(topic = %raw.topic, kind = kind.label(), "Message parsed");

        Ok(ParsedMessage {
            kind,
            update,
            warnings,
        })
    }

    fn parse_bus_position(
        &self,
        raw: &RawMessage,
        warnings: &mut Vec<ParseWarning>,
    ) -> MqttResult<Bus> {
        let wire: BusPositionWire = decode(raw)?;
        let fail = |reason: &str| MqttError::parsing_failed(&raw.topic, &raw.payload, reason);

        let id = wire.bus_id.trim();
        if id.is_empty() {
            return Err(fail("busId is blank"));
        }
        let line = wire.line.trim();
        if line.is_empty() {
            return Err(fail("line is blank"));
        }

        let position = match (wire.position, wire.latitude, wire.longitude) {
            (Some(position), _, _) => GeoPosition::new(position.lat, position.lon),
            (None, Some(lat), Some(lon)) => GeoPosition::new(lat, lon),
            _ => return Err(fail("missing position")),
        };
        if !position.is_valid() {
            return Err(fail("coordinates out of range"));
        }
        if !is_position_in_bounds(&position, &self.bounds) {
            warnings.push(ParseWarning::PositionOutOfBounds {
                lat: position.lat,
                lon: position.lon,
            });
        }

        let speed = wire.speed.unwrap_or(0.0);
        if !is_speed_plausible(speed, &self.bounds) {
            warnings.push(ParseWarning::SpeedOutOfRange(speed));
        }

        let passengers = wire.passengers.unwrap_or(0);
        if !is_passenger_count_plausible(passengers, &self.bounds) {
            warnings.push(ParseWarning::PassengersOutOfRange(passengers));
        }

        let status = match wire.status.as_deref() {
            None => BusStatus::InService,
            Some(value) => BusStatus::from_wire(value).unwrap_or_else(|| {
                warnings.push(ParseWarning::UnknownBusStatus(value.to_string()));
                BusStatus::InService
            }),
        };

        let line_name = wire
            .line_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Linea {line}"));

        Ok(Bus {
            id: id.to_string(),
            line: line.to_string(),
            line_name,
            position,
            speed_kmh: speed.max(0.0),
            bearing_deg: normalize_bearing(wire.bearing.unwrap_or(0.0)),
            delay_minutes: wire.delay.unwrap_or(0.0),
            passengers: to_count(passengers),
            status,
            last_update: timestamp(wire.timestamp.as_deref(), warnings),
        })
    }

    fn parse_line_statistics(
        &self,
        raw: &RawMessage,
        warnings: &mut Vec<ParseWarning>,
    ) -> MqttResult<LineStats> {
        let wire: LineStatisticsWire = decode(raw)?;
        let line = wire.line.trim();
        if line.is_empty() {
            return Err(MqttError::parsing_failed(
                &raw.topic,
                &raw.payload,
                "line is blank",
            ));
        }

        let active_buses = required(raw, wire.active_buses, "activeBuses")?;
        let average_delay = required(raw, wire.average_delay, "averageDelay")?;
        let max_delay = required(raw, wire.max_delay, "maxDelay")?;
        let on_time = required(raw, wire.on_time_percentage, "onTimePercentage")?;

        Ok(LineStats {
            line: line.to_string(),
            active_buses: to_count(active_buses),
            average_speed_kmh: wire.average_speed.unwrap_or(DEFAULT_AVERAGE_SPEED_KMH),
            average_delay_minutes: average_delay,
            max_delay_minutes: max_delay,
            on_time_percentage: on_time.clamp(0.0, 100.0),
            total_passengers: to_count(wire.total_passengers.unwrap_or(0)),
            last_update: timestamp(wire.timestamp.as_deref(), warnings),
        })
    }

    fn parse_system_status(
        &self,
        raw: &RawMessage,
        warnings: &mut Vec<ParseWarning>,
    ) -> MqttResult<SystemStatus> {
        let wire: SystemStatusWire = decode(raw)?;

        let total_buses = required(raw, wire.total_buses, "totalBuses")?;
        let active_buses = required(raw, wire.active_buses, "activeBuses")?;
        let total_passengers = required(raw, wire.total_passengers, "totalPassengers")?;
        let average_delay = required(raw, wire.average_system_delay, "averageSystemDelay")?;

        let system_health = match wire.system_health.as_deref() {
            None => SystemHealth::Good,
            Some(value) => SystemHealth::from_wire(value).unwrap_or_else(|| {
                warnings.push(ParseWarning::UnknownSystemHealth(value.to_string()));
                SystemHealth::Good
            }),
        };

        Ok(SystemStatus {
            total_buses: to_count(total_buses),
            active_buses: to_count(active_buses),
            total_passengers: to_count(total_passengers),
            average_system_delay_minutes: average_delay,
            system_health,
            last_update: timestamp(wire.timestamp.as_deref(), warnings),
        })
    }
}

fn decode<T: DeserializeOwned>(raw: &RawMessage) -> MqttResult<T> {
    serde_json::from_str(&raw.payload).map_err(|e| {
        MqttError::parsing_failed(&raw.topic, &raw.payload, format!("invalid JSON: {e}"))
    })
}

fn required<T>(raw: &RawMessage, value: Option<T>, field: &str) -> MqttResult<T> {
    value.ok_or_else(|| {
        MqttError::parsing_failed(&raw.topic, &raw.payload, format!("missing field {field}"))
    })
}

fn timestamp(value: Option<&str>, warnings: &mut Vec<ParseWarning>) -> DateTime<Utc> {
    let resolved = resolve_timestamp(value);
    if let (Timestamp::Fallback(_), Some(raw)) = (resolved, value) {
        warnings.push(ParseWarning::InvalidTimestamp(raw.to_string()));
    }
    resolved.value()
}

/// Round to whole degrees in `[0, 360)`
fn normalize_bearing(bearing: f64) -> u16 {
    if !bearing.is_finite() {
        return 0;
    }
    (bearing.round() as i64).rem_euclid(360) as u16
}

/// Clamp a wire count into `u32`
fn to_count(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}
