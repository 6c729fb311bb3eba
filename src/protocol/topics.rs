//! Topic registry for ViBus telemetry
//!
//! Three topic families are published by the fleet, each with a single
//! wildcard segment carrying the entity id:
//!
//! | Kind | Filter | QoS |
//! |---|---|---|
//! | bus position | `vibus/autobus/+/posizione` | 1 |
//! | line statistics | `vibus/linea/+/statistiche` | 0 |
//! | system status | `vibus/sistema/+/stato` | 1 |

use rumqttc::QoS;
use thiserror::Error;

pub const BUS_POSITION_FILTER: &str = "vibus/autobus/+/posizione";
pub const LINE_STATISTICS_FILTER: &str = "vibus/linea/+/statistiche";
pub const SYSTEM_STATUS_FILTER: &str = "vibus/sistema/+/stato";

pub const BUS_POSITION_QOS: QoS = QoS::AtLeastOnce;
pub const LINE_STATISTICS_QOS: QoS = QoS::AtMostOnce;
pub const SYSTEM_STATUS_QOS: QoS = QoS::AtLeastOnce;

/// The three message families carried on the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    BusPosition,
    LineStatistics,
    SystemStatus,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [
        TopicKind::BusPosition,
        TopicKind::LineStatistics,
        TopicKind::SystemStatus,
    ];

    /// Subscription filter for this family
    pub fn filter(self) -> &'static str {
        match self {
            Self::BusPosition => BUS_POSITION_FILTER,
            Self::LineStatistics => LINE_STATISTICS_FILTER,
            Self::SystemStatus => SYSTEM_STATUS_FILTER,
        }
    }

    /// Delivery guarantee the family is subscribed with
    pub fn qos(self) -> QoS {
        match self {
            Self::BusPosition => BUS_POSITION_QOS,
            Self::LineStatistics => LINE_STATISTICS_QOS,
            Self::SystemStatus => SYSTEM_STATUS_QOS,
        }
    }

    /// Classify a concrete topic. The families are mutually exclusive.
    pub fn classify(topic: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| extract_wildcard(kind.filter(), topic).is_some())
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::BusPosition => "bus_position",
            Self::LineStatistics => "line_statistics",
            Self::SystemStatus => "system_status",
        }
    }
}

/// Default subscription set: every family with its configured QoS
pub fn default_subscriptions() -> Vec<(String, QoS)> {
    TopicKind::ALL
        .into_iter()
        .map(|kind| (kind.filter().to_string(), kind.qos()))
        .collect()
}

/// Build `vibus/autobus/{bus_id}/posizione`
pub fn bus_position_topic(bus_id: &str) -> String {
    format!("vibus/autobus/{bus_id}/posizione")
}

/// Build `vibus/linea/{line_id}/statistiche`
pub fn line_statistics_topic(line_id: &str) -> String {
    format!("vibus/linea/{line_id}/statistiche")
}

/// Build `vibus/sistema/{component}/stato`
pub fn system_status_topic(component: &str) -> String {
    format!("vibus/sistema/{component}/stato")
}

/// Bus id from a bus-position topic
pub fn extract_bus_id(topic: &str) -> Option<&str> {
    extract_wildcard(BUS_POSITION_FILTER, topic)
}

/// Line id from a line-statistics topic
pub fn extract_line_id(topic: &str) -> Option<&str> {
    extract_wildcard(LINE_STATISTICS_FILTER, topic)
}

/// Component name from a system-status topic
pub fn extract_system_component(topic: &str) -> Option<&str> {
    extract_wildcard(SYSTEM_STATUS_FILTER, topic)
}

/// Return the level matched by the single `+` of `filter`, if `topic` matches.
/// The captured level must be non-empty.
fn extract_wildcard<'a>(filter: &str, topic: &'a str) -> Option<&'a str> {
    let mut captured = None;
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return captured,
            (Some("+"), Some(level)) => {
                if level.is_empty() {
                    return None;
                }
                captured = Some(level);
            }
            (Some(expected), Some(level)) if expected == level => {}
            _ => return None,
        }
    }
}

/// MQTT topic-filter matching with `+` (single level) and `#` (multi level)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Filters starting with a wildcard never match `$`-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            _ => return false,
        }
    }
}

/// Reasons a subscription filter is rejected
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic filter cannot be empty")]
    Empty,
    #[error("Multi-level wildcard '#' must be the last level: {0}")]
    MisplacedMultiLevelWildcard(String),
    #[error("Wildcards must occupy a whole level: {0}")]
    PartialWildcard(String),
    #[error("Topic filter contains a NUL character")]
    NulCharacter,
}

/// Validate a subscription filter per MQTT 3.1.1 section 4.7
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NulCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(TopicError::PartialWildcard(filter.to_string()));
            }
            if index != last {
                return Err(TopicError::MisplacedMultiLevelWildcard(filter.to_string()));
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::PartialWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Convert a numeric QoS into the transport enum
pub fn qos_from_u8(value: u8) -> Option<QoS> {
    match value {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Numeric value of a QoS level
pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
