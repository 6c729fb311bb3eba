//! Plausibility checks for bus telemetry
//!
//! Advisory by default: a failed check becomes a parse warning. With
//! `strict_validation` the parser rejects the message instead.

use crate::config::BoundsSection;
use crate::domain::GeoPosition;

/// Whether the position lies inside the configured service area
pub fn is_position_in_bounds(position: &GeoPosition, bounds: &BoundsSection) -> bool {
    (bounds.min_lat..=bounds.max_lat).contains(&position.lat)
        && (bounds.min_lon..=bounds.max_lon).contains(&position.lon)
}

/// Whether the speed is within `[0, max_speed_kmh]`
pub fn is_speed_plausible(speed_kmh: f64, bounds: &BoundsSection) -> bool {
    (0.0..=bounds.max_speed_kmh).contains(&speed_kmh)
}

/// Whether the passenger count is within `[0, max_passengers]`
pub fn is_passenger_count_plausible(passengers: i64, bounds: &BoundsSection) -> bool {
    (0..=i64::from(bounds.max_passengers)).contains(&passengers)
}
