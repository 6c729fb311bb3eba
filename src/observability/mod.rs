//! Observability: structured logging, pipeline metrics and the HTTP status server

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::StatusServer;
pub use logging::{init_default_logging, init_logging, init_with_default_level, LogFormat};
pub use metrics::{MetricsSnapshot, PipelineMetrics};

// Span macros for structured logging
pub use logging::{ingest_span, mqtt_span};
