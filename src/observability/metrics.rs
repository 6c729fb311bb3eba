//! Thread-safe pipeline metrics
//!
//! Atomic counters for the ingestion path of one [`LiveService`](crate::service::LiveService)
//! plus a bounded window of per-message processing times. Each service owns
//! its own collector; there is no process-wide instance.

use crate::protocol::topics::TopicKind;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Processing times kept for percentile calculation
const PROCESSING_WINDOW: usize = 1000;

#[derive(Debug)]
pub struct PipelineMetrics {
    bus_updates: AtomicU64,
    line_updates: AtomicU64,
    system_updates: AtomicU64,
    parse_failures: AtomicU64,
    gated_messages: AtomicU64,
    lagged_messages: AtomicU64,
    cache_evictions: AtomicU64,
    cleanup_runs: AtomicU64,
    last_update_at: AtomicU64,
    started_at: AtomicU64,
    processing_times: Mutex<VecDeque<u64>>, // microseconds
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            bus_updates: AtomicU64::new(0),
            line_updates: AtomicU64::new(0),
            system_updates: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            gated_messages: AtomicU64::new(0),
            lagged_messages: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            cleanup_runs: AtomicU64::new(0),
            last_update_at: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
            processing_times: Mutex::new(VecDeque::with_capacity(PROCESSING_WINDOW)),
        }
    }

    /// A parsed update reached the cache
    pub fn update_applied(&self, kind: TopicKind, elapsed: Duration) {
        let counter = match kind {
            TopicKind::BusPosition => &self.bus_updates,
            TopicKind::LineStatistics => &self.line_updates,
            TopicKind::SystemStatus => &self.system_updates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_update_at
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_processing_time(elapsed);
    }

    pub fn parse_failed(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An update was not newer than the cached one for its topic
    pub fn message_gated(&self) {
        self.gated_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages skipped because the ingestion task fell behind the broadcast buffer
    pub fn messages_lagged(&self, count: u64) {
        self.lagged_messages.fetch_add(count, Ordering::Relaxed);
    }

    pub fn cleanup_completed(&self, evicted: usize) {
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.cache_evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    fn record_processing_time(&self, elapsed: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            if times.len() == PROCESSING_WINDOW {
                times.pop_front();
            }
            times.push_back(elapsed.as_micros() as u64);
        }
    }

    fn processing_time_statistics(&self) -> ProcessingTimes {
        let mut sorted: Vec<u64> = match self.processing_times.lock() {
            Ok(times) => times.iter().copied().collect(),
            Err(_) => Vec::new(),
        };
        if sorted.is_empty() {
            return ProcessingTimes::default();
        }
        sorted.sort_unstable();

        ProcessingTimes {
            avg_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: percentile(&sorted, 50.0),
            p95_us: percentile(&sorted, 95.0),
            p99_us: percentile(&sorted, 99.0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let bus_updates = self.bus_updates.load(Ordering::Relaxed);
        let line_updates = self.line_updates.load(Ordering::Relaxed);
        let system_updates = self.system_updates.load(Ordering::Relaxed);

        MetricsSnapshot {
            updates: UpdateCounts {
                bus_position: bus_updates,
                line_statistics: line_updates,
                system_status: system_updates,
                total: bus_updates + line_updates + system_updates,
            },
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            gated_messages: self.gated_messages.load(Ordering::Relaxed),
            lagged_messages: self.lagged_messages.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            last_update_at: self.last_update_at.load(Ordering::Relaxed),
            processing_time: self.processing_time_statistics(),
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.bus_updates,
            &self.line_updates,
            &self.system_updates,
            &self.parse_failures,
            &self.gated_messages,
            &self.lagged_messages,
            &self.cache_evictions,
            &self.cleanup_runs,
            &self.last_update_at,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub updates: UpdateCounts,
    pub parse_failures: u64,
    pub gated_messages: u64,
    pub lagged_messages: u64,
    pub cache_evictions: u64,
    pub cleanup_runs: u64,
    /// Unix seconds of the last applied update, 0 if none
    pub last_update_at: u64,
    pub processing_time: ProcessingTimes,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCounts {
    pub bus_position: u64,
    pub line_statistics: u64,
    pub system_status: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingTimes {
    pub avg_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_update_counters() {
        let metrics = PipelineMetrics::new();

        metrics.update_applied(TopicKind::BusPosition, Duration::from_micros(120));
        metrics.update_applied(TopicKind::BusPosition, Duration::from_micros(80));
        metrics.update_applied(TopicKind::SystemStatus, Duration::from_micros(100));
        metrics.parse_failed();
        metrics.message_gated();
        metrics.messages_lagged(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.updates.bus_position, 2);
        assert_eq!(snapshot.updates.line_statistics, 0);
        assert_eq!(snapshot.updates.total, 3);
        assert_eq!(snapshot.parse_failures, 1);
        assert_eq!(snapshot.gated_messages, 1);
        assert_eq!(snapshot.lagged_messages, 7);
        assert!(snapshot.last_update_at > 0);
        assert!((snapshot.processing_time.avg_us - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_cleanup_accounting() {
        let metrics = PipelineMetrics::new();
        metrics.cleanup_completed(3);
        metrics.cleanup_completed(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cleanup_runs, 2);
        assert_eq!(snapshot.cache_evictions, 3);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(PipelineMetrics::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.update_applied(TopicKind::LineStatistics, Duration::ZERO);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().updates.line_statistics, 1000);
    }

    #[test]
    fn test_processing_window_is_bounded() {
        let metrics = PipelineMetrics::new();
        for i in 0..1500 {
            metrics.update_applied(TopicKind::BusPosition, Duration::from_micros(i));
        }
        assert_eq!(metrics.processing_times.lock().unwrap().len(), PROCESSING_WINDOW);
        // Oldest 500 samples were dropped
        assert!(metrics.snapshot().processing_time.p50_us >= 500.0);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_reset() {
        let metrics = PipelineMetrics::new();
        metrics.update_applied(TopicKind::BusPosition, Duration::from_micros(5));
        metrics.parse_failed();

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.updates.total, 0);
        assert_eq!(snapshot.parse_failures, 0);
        assert_eq!(snapshot.processing_time.avg_us, 0.0);
    }
}
