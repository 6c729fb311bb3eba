//! ViBus wire protocol: topic registry and payload schemas

pub mod messages;
pub mod topics;

pub use messages::{BusPositionWire, LineStatisticsWire, SystemStatusWire, WirePosition};
pub use topics::{
    bus_position_topic, default_subscriptions, extract_bus_id, extract_line_id,
    extract_system_component, line_statistics_topic, system_status_topic, topic_matches,
    validate_topic_filter, TopicError, TopicKind,
};
