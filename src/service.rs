//! Live telemetry service
//!
//! Wires the [`ConnectionManager`] to the [`MessageParser`] and the
//! [`MessageCache`] and owns the background tasks that keep them running:
//!
//! - a state watcher that subscribes the configured topics on the first
//!   `Connected` state that accepts them; later sessions get them from the
//!   manager's replay, so a topic the consumer unsubscribes stays gone
//! - the ingestion task: message stream, parser, monotonic gate, cache
//! - the periodic cache cleanup
//! - optionally the HTTP status server
//!
//! Tasks stop when [`LiveService::stop`] flips the shutdown watch.

use crate::cache::MessageCache;
use crate::config::LiveConfig;
use crate::domain::{ParsedUpdate, RawMessage};
use crate::error::{MqttError, MqttResult};
use crate::ingest_span;
use crate::observability::{MetricsSnapshot, PipelineMetrics, StatusServer};
use crate::processing::MessageParser;
use crate::transport::mqtt::ConnectionManager;
use crate::transport::Transport;
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Grace period for background tasks after the shutdown signal
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Not newer than the cached update for its topic
    Gated,
    /// Dropped as unparsable
    Rejected,
}

/// The message path shared by the ingestion task
#[derive(Clone)]
struct Pipeline {
    manager: ConnectionManager,
    parser: Arc<MessageParser>,
    cache: MessageCache,
    metrics: Arc<PipelineMetrics>,
    updates_tx: broadcast::Sender<ParsedUpdate>,
}

impl Pipeline {
    fn process(&self, raw: &RawMessage) -> IngestOutcome {
        let span = ingest_span!(topic = %raw.topic, bytes = raw.payload.len());
        let _entered = span.enter();
        let started = Instant::now();

        let parsed = match self.parser.parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.manager.record_message_lost();
                self.metrics.parse_failed();
                warn!("Dropping message: {}", e);
                return IngestOutcome::Rejected;
            }
        };

        let timestamp = parsed.update.timestamp();
        if !self.cache.should_process_message(&raw.topic, timestamp) {
            self.metrics.message_gated();
            debug!(%timestamp, "Skipping update that is not newer than the cached one");
            return IngestOutcome::Gated;
        }

        self.cache.apply(&raw.topic, parsed.update.clone());
        self.metrics.update_applied(parsed.kind, started.elapsed());
        // No receivers is fine
        let _ = self.updates_tx.send(parsed.update);
        IngestOutcome::Applied
    }
}

/// Owns the connection, the pipeline and their background tasks
pub struct LiveService {
    config: LiveConfig,
    pipeline: Pipeline,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveService {
    pub fn new(config: LiveConfig, transport: Arc<dyn Transport>) -> Self {
        let manager = ConnectionManager::new(transport, &config);
        let (updates_tx, _) = broadcast::channel(config.channels.message_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            pipeline: Pipeline {
                manager,
                parser: Arc::new(MessageParser::new(&config.parser)),
                cache: MessageCache::new(),
                metrics: Arc::new(PipelineMetrics::new()),
                updates_tx,
            },
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect and spawn the background tasks.
    ///
    /// A failed initial connect is tolerated when auto-reconnect is enabled;
    /// the topics are subscribed once the manager reconnects.
    pub async fn start(&self) -> MqttResult<()> {
        if self.is_running() {
            warn!("start() called on a running service");
            return Ok(());
        }

        let broker = self
            .config
            .broker_config()
            .map_err(|e| MqttError::connection_failed(e.to_string()))?;

        self.shutdown_tx.send_replace(false);
        info!(broker = %broker.broker_url(), "Starting live service");

        // Subscribe to the streams before connecting so nothing is missed
        let mut handles = vec![
            spawn_ingestion(
                self.pipeline.clone(),
                self.pipeline.manager.subscribe_messages(),
                self.shutdown_tx.subscribe(),
            ),
            spawn_subscription_watcher(
                self.pipeline.manager.clone(),
                self.config.subscription_set(),
                self.shutdown_tx.subscribe(),
            ),
            spawn_cleanup(
                self.pipeline.cache.clone(),
                self.pipeline.metrics.clone(),
                self.config.cache_max_age(),
                self.config.cache_cleanup_interval(),
                self.shutdown_tx.subscribe(),
            ),
        ];

        if self.config.http.enabled {
            let server = StatusServer::new(
                self.config.http.port,
                self.pipeline.manager.clone(),
                self.pipeline.cache.clone(),
                self.pipeline.metrics.clone(),
            );
            match server.bind(self.shutdown_tx.subscribe()) {
                Ok((addr, serve)) => {
                    info!("Status server listening on {}", addr);
                    handles.push(tokio::spawn(serve));
                }
                Err(e) => error!("Failed to start status server on port {}: {}", server.port(), e),
            }
        }

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        if let Err(e) = self.pipeline.manager.connect(broker).await {
            if self.config.reconnect.auto_reconnect {
                warn!("Initial connection failed, retrying in background: {}", e);
            } else {
                error!("Initial connection failed: {}", e);
                self.stop().await?;
                return Err(e);
            }
        }

        info!("Live service started");
        Ok(())
    }

    /// Stop the background tasks, disconnect and reset the cache
    pub async fn stop(&self) -> MqttResult<()> {
        info!("Stopping live service");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut handle in handles {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Background task did not stop in time, aborting");
                handle.abort();
            }
        }

        let result = self.pipeline.manager.disconnect().await;
        self.pipeline.cache.clear();
        info!("Live service stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|handle| !handle.is_finished())
    }

    /// Run one message through the pipeline, bypassing the broker
    pub fn ingest(&self, raw: &RawMessage) -> IngestOutcome {
        self.pipeline.process(raw)
    }

    pub fn cache(&self) -> &MessageCache {
        &self.pipeline.cache
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.pipeline.manager
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics.snapshot()
    }

    /// Stream of updates that reached the cache (drop-oldest)
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ParsedUpdate> {
        self.pipeline.updates_tx.subscribe()
    }
}

impl Drop for LiveService {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }
}

fn spawn_ingestion(
    pipeline: Pipeline,
    messages: broadcast::Receiver<RawMessage>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_ingestion(pipeline, messages, shutdown))
}

async fn run_ingestion(
    pipeline: Pipeline,
    mut messages: broadcast::Receiver<RawMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = messages.recv() => match received {
                Ok(raw) => {
                    pipeline.process(&raw);
                }
                Err(RecvError::Lagged(skipped)) => {
                    pipeline.metrics.messages_lagged(skipped);
                    warn!(skipped, "Ingestion fell behind, oldest messages dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Ingestion task stopped");
}

fn spawn_subscription_watcher(
    manager: ConnectionManager,
    topics: Vec<(String, QoS)>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_subscription_watcher(manager, topics, shutdown))
}

async fn run_subscription_watcher(
    manager: ConnectionManager,
    topics: Vec<(String, QoS)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state_rx = manager.subscribe_state();
    let mut pending = topics;
    loop {
        let connected = state_rx.borrow_and_update().is_connected();
        if connected {
            pending = subscribe_pending(&manager, pending).await;
            if pending.is_empty() {
                // The manager replays the set from here on
                debug!("Configured topics subscribed");
                break;
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Subscription watcher stopped");
}

/// Subscribe the configured topics not yet accepted. Returns those still pending.
async fn subscribe_pending(
    manager: &ConnectionManager,
    pending: Vec<(String, QoS)>,
) -> Vec<(String, QoS)> {
    let active: HashSet<String> = manager
        .active_subscriptions()
        .await
        .into_iter()
        .filter(|subscription| subscription.active)
        .map(|subscription| subscription.topic)
        .collect();

    let mut remaining = Vec::new();
    for (topic, qos) in pending {
        if active.contains(&topic) {
            continue;
        }
        if let Err(e) = manager.subscribe(&topic, qos).await {
            warn!("Failed to subscribe to {}: {}", topic, e);
            remaining.push((topic, qos));
        }
    }
    remaining
}

fn spawn_cleanup(
    cache: MessageCache,
    metrics: Arc<PipelineMetrics>,
    max_age: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // First tick completes immediately, skip it

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let report = cache.cleanup(max_age);
                    metrics.cleanup_completed(report.evicted());
                    debug!(evicted = report.evicted(), remaining = cache.len(), "Cache cleanup");
                }
            }
        }
    })
}
