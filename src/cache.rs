//! Latest-state cache of parsed telemetry
//!
//! Entities are keyed by their natural id (bus id, line id, the single
//! system slot). A separate map tracks the last processed timestamp per
//! key and backs the monotonic gate [`MessageCache::should_process_message`].
//! The pipeline records under the raw topic; direct upserts record under the
//! entity's canonical topic, so both paths share one key space for bus and
//! line updates.

use crate::domain::{Bus, LineStats, ParsedUpdate, SystemStatus};
use crate::protocol::topics::{bus_position_topic, line_statistics_topic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Timestamp key used by [`MessageCache::update_system_status`]
pub const SYSTEM_STATUS_KEY: &str = "system";

#[derive(Debug, Default)]
struct CacheState {
    buses: HashMap<String, Bus>,
    lines: HashMap<String, LineStats>,
    system: Option<SystemStatus>,
    last_update: HashMap<String, DateTime<Utc>>,
}

/// Entries removed by one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub buses: usize,
    pub lines: usize,
    pub system: bool,
    pub timestamps: usize,
}

impl CleanupReport {
    /// Number of entities evicted (timestamps excluded)
    pub fn evicted(&self) -> usize {
        self.buses + self.lines + usize::from(self.system)
    }
}

/// Thread-safe cache with a single writer (the pipeline) and many readers
#[derive(Debug, Clone, Default)]
pub struct MessageCache {
    state: Arc<RwLock<CacheState>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        // State stays consistent across a panicking writer; every mutation is a single insert/remove
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a bus by id
    pub fn update_bus_position(&self, bus: Bus) {
        let key = bus_position_topic(&bus.id);
        let mut state = self.write();
        state.last_update.insert(key, bus.last_update);
        state.buses.insert(bus.id.clone(), bus);
    }

    /// Upsert line statistics by line id
    pub fn update_line_stats(&self, stats: LineStats) {
        let key = line_statistics_topic(&stats.line);
        let mut state = self.write();
        state.last_update.insert(key, stats.last_update);
        state.lines.insert(stats.line.clone(), stats);
    }

    /// Replace the system status
    pub fn update_system_status(&self, status: SystemStatus) {
        let mut state = self.write();
        state
            .last_update
            .insert(SYSTEM_STATUS_KEY.to_string(), status.last_update);
        state.system = Some(status);
    }

    /// Upsert an update received on `topic`, recording its timestamp for the topic
    pub fn apply(&self, topic: &str, update: ParsedUpdate) {
        let timestamp = update.timestamp();
        let mut state = self.write();
        match update {
            ParsedUpdate::BusPosition(bus) => {
                state.buses.insert(bus.id.clone(), bus);
            }
            ParsedUpdate::LineStatistics(stats) => {
                state.lines.insert(stats.line.clone(), stats);
            }
            ParsedUpdate::SystemStatus(status) => {
                state.system = Some(status);
            }
        }
        state.last_update.insert(topic.to_string(), timestamp);
    }

    /// True if nothing was recorded for `topic` yet or `timestamp` is strictly newer
    pub fn should_process_message(&self, topic: &str, timestamp: DateTime<Utc>) -> bool {
        match self.read().last_update.get(topic) {
            Some(last) => timestamp > *last,
            None => true,
        }
    }

    pub fn get_bus_positions(&self) -> Vec<Bus> {
        self.read().buses.values().cloned().collect()
    }

    pub fn get_line_statistics(&self) -> Vec<LineStats> {
        self.read().lines.values().cloned().collect()
    }

    pub fn get_system_status(&self) -> Option<SystemStatus> {
        self.read().system.clone()
    }

    pub fn get_bus(&self, id: &str) -> Option<Bus> {
        self.read().buses.get(id).cloned()
    }

    pub fn get_line(&self, line: &str) -> Option<LineStats> {
        self.read().lines.get(line).cloned()
    }

    /// Number of cached entities
    pub fn len(&self) -> usize {
        let state = self.read();
        state.buses.len() + state.lines.len() + usize::from(state.system.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.write();
        *state = CacheState::default();
        debug!("Message cache cleared");
    }

    /// Evict every entry whose last update is older than `max_age`
    pub fn cleanup(&self, max_age: Duration) -> CleanupReport {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return CleanupReport::default();
        };

        let mut report = CleanupReport::default();
        let mut state = self.write();

        let before = state.buses.len();
        state.buses.retain(|_, bus| bus.last_update >= cutoff);
        report.buses = before - state.buses.len();

        let before = state.lines.len();
        state.lines.retain(|_, stats| stats.last_update >= cutoff);
        report.lines = before - state.lines.len();

        if state
            .system
            .as_ref()
            .is_some_and(|status| status.last_update < cutoff)
        {
            state.system = None;
            report.system = true;
        }

        let before = state.last_update.len();
        state.last_update.retain(|_, ts| *ts >= cutoff);
        report.timestamps = before - state.last_update.len();

        if report.evicted() > 0 {
            info!(
                buses = report.buses,
                lines = report.lines,
                system = report.system,
                "Evicted stale cache entries"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BusStatus, GeoPosition, SystemHealth};

    fn bus(id: &str, last_update: DateTime<Utc>) -> Bus {
        Bus {
            id: id.to_string(),
            line: "1".to_string(),
            line_name: "Linea 1".to_string(),
            position: GeoPosition::new(45.55, 11.55),
            speed_kmh: 20.0,
            bearing_deg: 0,
            delay_minutes: 0.0,
            passengers: 10,
            status: BusStatus::InService,
            last_update,
        }
    }

    fn line(id: &str, last_update: DateTime<Utc>) -> LineStats {
        LineStats {
            line: id.to_string(),
            active_buses: 3,
            average_speed_kmh: 25.0,
            average_delay_minutes: 1.0,
            max_delay_minutes: 4.0,
            on_time_percentage: 90.0,
            total_passengers: 40,
            last_update,
        }
    }

    fn system(last_update: DateTime<Utc>) -> SystemStatus {
        SystemStatus {
            total_buses: 10,
            active_buses: 9,
            total_passengers: 100,
            average_system_delay_minutes: 1.0,
            system_health: SystemHealth::Good,
            last_update,
        }
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let cache = MessageCache::new();
        let now = Utc::now();

        cache.update_bus_position(bus("A", now));
        let mut moved = bus("A", now);
        moved.delay_minutes = 3.0;
        cache.update_bus_position(moved);
        cache.update_bus_position(bus("B", now));

        assert_eq!(cache.get_bus_positions().len(), 2);
        assert_eq!(cache.get_bus("A").unwrap().delay_minutes, 3.0);
        assert!(cache.get_bus("C").is_none());
    }

    #[test]
    fn test_monotonic_gate() {
        let cache = MessageCache::new();
        let topic = "vibus/autobus/A/posizione";
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        assert!(cache.should_process_message(topic, t0));
        cache.apply(topic, ParsedUpdate::BusPosition(bus("A", t0)));

        assert!(!cache.should_process_message(topic, t0));
        assert!(!cache.should_process_message(topic, t0 - chrono::Duration::seconds(1)));
        assert!(cache.should_process_message(topic, t1));
        assert!(cache.should_process_message("vibus/autobus/B/posizione", t0));
    }

    #[test]
    fn test_direct_upsert_feeds_gate_for_canonical_topic() {
        let cache = MessageCache::new();
        let t0 = Utc::now();
        cache.update_bus_position(bus("A", t0));
        assert!(!cache.should_process_message(&bus_position_topic("A"), t0));

        cache.update_line_stats(line("7", t0));
        assert!(!cache.should_process_message(&line_statistics_topic("7"), t0));
    }

    #[test]
    fn test_cleanup_evicts_stale_entries() {
        let cache = MessageCache::new();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(10);

        cache.update_bus_position(bus("fresh", now));
        cache.update_bus_position(bus("stale", old));
        cache.update_line_stats(line("1", old));
        cache.update_line_stats(line("2", now));
        cache.update_system_status(system(old));

        let report = cache.cleanup(Duration::from_secs(300));

        assert_eq!(
            report,
            CleanupReport {
                buses: 1,
                lines: 1,
                system: true,
                timestamps: 3,
            }
        );
        assert!(cache.get_bus("fresh").is_some());
        assert!(cache.get_bus("stale").is_none());
        assert_eq!(cache.get_line_statistics().len(), 1);
        assert!(cache.get_system_status().is_none());
        assert!(cache.should_process_message(&bus_position_topic("stale"), old));
    }

    #[test]
    fn test_cleanup_keeps_fresh_system_status() {
        let cache = MessageCache::new();
        cache.update_system_status(system(Utc::now()));
        let report = cache.cleanup(Duration::from_secs(60));
        assert!(!report.system);
        assert!(cache.get_system_status().is_some());
    }

    #[test]
    fn test_len_and_clear() {
        let cache = MessageCache::new();
        let now = Utc::now();
        assert!(cache.is_empty());

        cache.apply("t/1", ParsedUpdate::BusPosition(bus("A", now)));
        cache.apply("t/2", ParsedUpdate::LineStatistics(line("1", now)));
        cache.apply("t/3", ParsedUpdate::SystemStatus(system(now)));
        assert_eq!(cache.len(), 3);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.should_process_message("t/1", now));
    }

    #[test]
    fn test_clones_share_state() {
        let cache = MessageCache::new();
        let reader = cache.clone();
        cache.update_bus_position(bus("A", Utc::now()));
        assert_eq!(reader.get_bus_positions().len(), 1);
    }
}
