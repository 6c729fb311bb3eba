//! Tolerant timestamp parsing
//!
//! Publishers send either ISO-8601 with a `T` separator (optionally with a
//! trailing `Z` or a numeric offset) or `yyyy-MM-dd HH:mm:ss`. Times without
//! an offset are UTC. Anything else resolves to the current time; parsing
//! never fails.

use chrono::{DateTime, NaiveDateTime, Utc};

const ISO_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];
const SPACE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of resolving a wire timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp {
    /// The wire value was understood
    Parsed(DateTime<Utc>),
    /// No value was sent; the receive time is used
    Missing(DateTime<Utc>),
    /// The value could not be understood; the receive time is used
    Fallback(DateTime<Utc>),
}

impl Timestamp {
    pub fn value(self) -> DateTime<Utc> {
        match self {
            Self::Parsed(ts) | Self::Missing(ts) | Self::Fallback(ts) => ts,
        }
    }

    pub fn is_fallback(self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// Parse one of the supported formats
pub fn parse_wire_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if value.contains('T') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Some(ts.with_timezone(&Utc));
        }
        let naive = value.strip_suffix('Z').unwrap_or(value);
        return ISO_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
            .map(|ts| ts.and_utc());
    }

    NaiveDateTime::parse_from_str(value, SPACE_FORMAT)
        .ok()
        .map(|ts| ts.and_utc())
}

/// Resolve an optional wire timestamp, falling back to the current time
pub fn resolve_timestamp(value: Option<&str>) -> Timestamp {
    match value {
        None => Timestamp::Missing(Utc::now()),
        Some(raw) if raw.trim().is_empty() => Timestamp::Missing(Utc::now()),
        Some(raw) => match parse_wire_timestamp(raw) {
            Some(ts) => Timestamp::Parsed(ts),
            None => Timestamp::Fallback(Utc::now()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_iso_formats() {
        let expected = utc(2025, 1, 20, 15, 30, 45);
        assert_eq!(parse_wire_timestamp("2025-01-20T15:30:45"), Some(expected));
        assert_eq!(parse_wire_timestamp("2025-01-20T15:30:45Z"), Some(expected));
        assert_eq!(
            parse_wire_timestamp("2025-01-20T16:30:45+01:00"),
            Some(expected)
        );

        let fractional = parse_wire_timestamp("2025-01-20T15:30:45.250Z").unwrap();
        assert_eq!(fractional.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_space_separated_format() {
        assert_eq!(
            parse_wire_timestamp("2025-01-20 15:30:45"),
            Some(utc(2025, 1, 20, 15, 30, 45))
        );
    }

    #[test]
    fn test_unsupported_shapes() {
        assert_eq!(parse_wire_timestamp("20/01/2025 15:30"), None);
        assert_eq!(parse_wire_timestamp("2025-01-20"), None);
        assert_eq!(parse_wire_timestamp("2025-13-40T99:99:99"), None);
        assert_eq!(parse_wire_timestamp("yesterday"), None);
    }

    #[test]
    fn test_resolve_falls_back_to_now() {
        let before = Utc::now();
        let resolved = resolve_timestamp(Some("garbage"));
        let after = Utc::now();

        assert!(resolved.is_fallback());
        assert!(resolved.value() >= before && resolved.value() <= after);
        assert!(matches!(resolve_timestamp(None), Timestamp::Missing(_)));
        assert!(matches!(resolve_timestamp(Some("  ")), Timestamp::Missing(_)));
        assert_eq!(
            resolve_timestamp(Some("2025-01-20T15:30:45")),
            Timestamp::Parsed(utc(2025, 1, 20, 15, 30, 45))
        );
    }

    proptest! {
        #[test]
        fn resolving_any_string_never_panics(input in ".*") {
            let resolved = resolve_timestamp(Some(&input));
            let _ = resolved.value();
        }

        #[test]
        fn valid_space_timestamps_round_trip(
            y in 1970i32..2100, mo in 1u32..=12, d in 1u32..=28,
            h in 0u32..24, mi in 0u32..60, s in 0u32..60,
        ) {
            let text = format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}");
            prop_assert_eq!(parse_wire_timestamp(&text), Some(utc(y, mo, d, h, mi, s)));
        }
    }
}
