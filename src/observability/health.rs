//! Read-only HTTP status server
//!
//! Exposes connection health, pipeline metrics and the cached telemetry as
//! JSON for operators and container orchestration.

use crate::cache::MessageCache;
use crate::observability::metrics::{current_timestamp, PipelineMetrics};
use crate::transport::mqtt::{ConnectionManager, ConnectionState, ConnectionStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// Shared handles the routes read from
#[derive(Clone)]
struct StatusState {
    manager: ConnectionManager,
    cache: MessageCache,
    metrics: Arc<PipelineMetrics>,
}

/// HTTP status server
pub struct StatusServer {
    port: u16,
    state: StatusState,
}

impl StatusServer {
    pub fn new(
        port: u16,
        manager: ConnectionManager,
        cache: MessageCache,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            port,
            state: StatusState {
                manager,
                cache,
                metrics,
            },
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, CORS enabled
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let state = self.state.clone();
        let with_state = warp::any().map(move || state.clone());

        // GET /health - connection health, 503 while not connected
        let health_route = warp::path!("health")
            .and(warp::get())
            .and(with_state.clone())
            .and_then(health_handler);

        // GET /metrics - pipeline counters
        let metrics_route = warp::path!("metrics")
            .and(warp::get())
            .and(with_state.clone())
            .map(|state: StatusState| warp::reply::json(&state.metrics.snapshot()));

        // GET /buses - cached bus positions
        let buses_route = warp::path!("buses")
            .and(warp::get())
            .and(with_state.clone())
            .map(|state: StatusState| {
                let mut buses = state.cache.get_bus_positions();
                buses.sort_by(|a, b| a.id.cmp(&b.id));
                warp::reply::json(&buses)
            });

        // GET /buses/{id}
        let bus_route = warp::path!("buses" / String)
            .and(warp::get())
            .and(with_state.clone())
            .map(|id: String, state: StatusState| {
                json_or_not_found(state.cache.get_bus(&id), format!("Unknown bus: {id}"))
            });

        // GET /lines - cached line statistics
        let lines_route = warp::path!("lines")
            .and(warp::get())
            .and(with_state.clone())
            .map(|state: StatusState| {
                let mut lines = state.cache.get_line_statistics();
                lines.sort_by(|a, b| a.line.cmp(&b.line));
                warp::reply::json(&lines)
            });

        // GET /system - latest system status
        let system_route = warp::path!("system")
            .and(warp::get())
            .and(with_state)
            .map(|state: StatusState| {
                json_or_not_found(
                    state.cache.get_system_status(),
                    "No system status received yet".to_string(),
                )
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Connection health (503 while disconnected)"),
                ("/metrics", "Pipeline metrics"),
                ("/buses", "Cached bus positions"),
                ("/buses/{id}", "A single cached bus"),
                ("/lines", "Cached line statistics"),
                ("/system", "Latest system status"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(buses_route)
            .or(bus_route)
            .or(lines_route)
            .or(system_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Bind on all interfaces. The returned future serves until `shutdown` changes.
    pub fn bind(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static), warp::Error> {
        let signal = async move {
            // Any change (or a dropped sender) means shutdown
            let _ = shutdown.changed().await;
        };
        warp::serve(self.routes()).try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), signal)
    }
}

async fn health_handler(state: StatusState) -> Result<impl warp::Reply, Infallible> {
    let connection_state = state.manager.state();
    let connection = state.manager.connection_stats().await;
    let healthy = connection_state.is_connected();

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        connection_state,
        connection,
        cached_buses: state.cache.get_bus_positions().len(),
        timestamp: current_timestamp(),
    };
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&response),
        status_code,
    ))
}

fn json_or_not_found<T: Serialize>(
    value: Option<T>,
    missing: String,
) -> warp::reply::WithStatus<warp::reply::Json> {
    match value {
        Some(value) => warp::reply::with_status(warp::reply::json(&value), StatusCode::OK),
        None => warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                error: missing,
                timestamp: current_timestamp(),
            }),
            StatusCode::NOT_FOUND,
        ),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connection_state: ConnectionState,
    connection: ConnectionStats,
    cached_buses: usize,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: u64,
}
