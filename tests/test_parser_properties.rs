//! Property tests for bus-position decoding

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use vibus_live::domain::{ParsedUpdate, RawMessage};
use vibus_live::processing::MessageParser;

fn raw(topic: String, payload: String) -> RawMessage {
    RawMessage {
        topic,
        payload,
        qos: 1,
        retained: false,
        received_at: Utc::now(),
    }
}

proptest! {
    #[test]
    fn in_range_fields_map_without_loss(
        id in "[A-Z]{3}[0-9]{1,4}",
        line in "[0-9]{1,2}",
        lat in 45.40f64..45.65,
        lon in 11.40f64..11.70,
        speed in 0.0f64..100.0,
        bearing in 0u16..360,
        delay in -30.0f64..30.0,
        passengers in 0u32..=80,
    ) {
        let payload = json!({
            "bus_id": id,
            "line": line,
            "position": {"lat": lat, "lon": lon},
            "speed": speed,
            "bearing": bearing,
            "delay": delay,
            "passengers": passengers,
            "timestamp": "2025-01-20T15:30:45Z",
        });
        let topic = format!("vibus/autobus/{id}/posizione");

        let parsed = MessageParser::default()
            .parse(&raw(topic, payload.to_string()))
            .unwrap();

        prop_assert!(parsed.warnings.is_empty());
        let bus = match parsed.update {
            ParsedUpdate::BusPosition(bus) => bus,
            other => panic!("unexpected update: {other:?}"),
        };
        prop_assert_eq!(bus.id, id);
        prop_assert_eq!(bus.line, line);
        prop_assert_eq!(bus.position.lat, lat);
        prop_assert_eq!(bus.position.lon, lon);
        prop_assert_eq!(bus.speed_kmh, speed);
        prop_assert_eq!(bus.bearing_deg, bearing);
        prop_assert_eq!(bus.delay_minutes, delay);
        prop_assert_eq!(bus.passengers, passengers);
    }

    #[test]
    fn blank_identifiers_are_rejected(
        blank in "[ \t]{0,4}",
        blank_id in any::<bool>(),
    ) {
        let (id, line) = if blank_id {
            (blank.clone(), "1".to_string())
        } else {
            ("SVT1".to_string(), blank.clone())
        };
        let payload = json!({
            "bus_id": id,
            "line": line,
            "position": {"lat": 45.5, "lon": 11.5},
        });

        let result = MessageParser::default()
            .parse(&raw("vibus/autobus/SVT1/posizione".to_string(), payload.to_string()));

        prop_assert!(result.is_err());
    }

    #[test]
    fn arbitrary_payloads_never_panic(payload in ".{0,200}") {
        let _ = MessageParser::default()
            .parse(&raw("vibus/autobus/SVT1/posizione".to_string(), payload.clone()));
        let _ = MessageParser::default()
            .parse(&raw("vibus/linea/1/statistiche".to_string(), payload.clone()));
        let _ = MessageParser::default()
            .parse(&raw("vibus/sistema/generale/stato".to_string(), payload));
    }
}
