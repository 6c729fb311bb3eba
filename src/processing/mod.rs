//! Payload processing: classification, decoding and validation

pub mod parser;
pub mod timestamps;
pub mod validation;

pub use parser::{MessageParser, ParseWarning, ParsedMessage, DEFAULT_AVERAGE_SPEED_KMH};
pub use timestamps::{parse_wire_timestamp, resolve_timestamp, Timestamp};
