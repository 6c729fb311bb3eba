//! Connection lifecycle, subscriptions and auto-reconnect
//!
//! A [`ConnectionManager`] keeps at most one transport session open, replays
//! its subscriptions after every reconnect and fans inbound messages and
//! state transitions out on bounded broadcast channels. A slow consumer
//! loses the oldest entries (`RecvError::Lagged`); it never blocks ingestion.
//!
//! Locking order is `op_lock` before `reconnect`. Every path that may start
//! the reconnect loop holds `op_lock`, and the loop holds it for the whole
//! connect-and-replay step. `connect` and `disconnect` only signal the loop
//! before taking `op_lock` and abort it once they hold the lock, so an abort
//! never lands in the middle of a subscription replay.

use super::connection::{
    generate_client_id, ConnectOptions, ConnectionEvent, ConnectionState, ConnectionStats,
    Subscription,
};
use super::reconnect::{should_attempt_reconnection, Backoff, ReconnectConfig, ReconnectDecision};
use crate::config::{BrokerConfig, LiveConfig};
use crate::domain::RawMessage;
use crate::error::{MqttError, MqttResult};
use crate::protocol::topics::validate_topic_filter;
use crate::transport::{Transport, TransportEvent};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffer between the transport and the ingestion pump
const INBOUND_BUFFER: usize = 256;

/// Session parameters applied to every connection attempt
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub event_buffer: usize,
    pub message_buffer: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            client_id_prefix: "vibus".to_string(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            event_buffer: 10,
            message_buffer: 50,
        }
    }
}

impl From<&LiveConfig> for ManagerOptions {
    fn from(config: &LiveConfig) -> Self {
        Self {
            client_id_prefix: config.broker.client_id_prefix.clone(),
            keep_alive: config.keep_alive(),
            clean_session: config.broker.clean_session,
            connect_timeout: config.connect_timeout(),
            reconnect: config.reconnect_config(),
            event_buffer: config.channels.event_buffer,
            message_buffer: config.channels.message_buffer,
        }
    }
}

struct SessionInfo {
    broker: Option<BrokerConfig>,
    client_id: String,
    connected_since: Option<Instant>,
    last_error: Option<String>,
    backoff: Backoff,
    attempts_in_streak: u32,
}

struct ReconnectHandle {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: ManagerOptions,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    messages_tx: broadcast::Sender<RawMessage>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    session: Mutex<SessionInfo>,
    op_lock: Mutex<()>,
    reconnect: Mutex<Option<ReconnectHandle>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    messages_received: AtomicU64,
    messages_lost: AtomicU64,
    reconnect_count: AtomicU32,
}

/// Owns the broker connection of one service instance
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: &LiveConfig) -> Self {
        Self::with_options(transport, ManagerOptions::from(config))
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ManagerOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(options.event_buffer.max(1));
        let (messages_tx, _) = broadcast::channel(options.message_buffer.max(1));
        let backoff = Backoff::from_config(&options.reconnect);

        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                state_tx,
                events_tx,
                messages_tx,
                subscriptions: Mutex::new(HashMap::new()),
                session: Mutex::new(SessionInfo {
                    broker: None,
                    client_id: String::new(),
                    connected_since: None,
                    last_error: None,
                    backoff,
                    attempts_in_streak: 0,
                }),
                op_lock: Mutex::new(()),
                reconnect: Mutex::new(None),
                pump: Mutex::new(None),
                messages_received: AtomicU64::new(0),
                messages_lost: AtomicU64::new(0),
                reconnect_count: AtomicU32::new(0),
            }),
        }
    }

    /// Connect to the broker. No-op when already connected.
    ///
    /// On failure the error is returned and, with auto-reconnect enabled,
    /// the reconnect loop keeps trying in the background.
    pub async fn connect(&self, broker: BrokerConfig) -> MqttResult<()> {
        signal_reconnect_cancel(&self.inner).await;
        let _guard = self.inner.op_lock.lock().await;
        stop_reconnect(&self.inner).await;

        if self.inner.transport.is_connected() && self.state().is_connected() {
            debug!("connect() called while already connected");
            return Ok(());
        }

        self.inner.session.lock().await.broker = Some(broker.clone());

        match try_connect(&self.inner, &broker).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.inner.options.reconnect.auto_reconnect {
                    start_reconnect(&self.inner).await;
                }
                Err(e)
            }
        }
    }

    /// Cancel any reconnect loop, close the session and clear subscriptions.
    /// Safe to call when already disconnected.
    pub async fn disconnect(&self) -> MqttResult<()> {
        signal_reconnect_cancel(&self.inner).await;
        let _guard = self.inner.op_lock.lock().await;
        // Also covers a loop started while we waited for the lock
        stop_reconnect(&self.inner).await;

        let result = self.inner.transport.disconnect().await;
        if let Some(pump) = self.inner.pump.lock().await.take() {
            pump.abort();
        }

        self.inner.subscriptions.lock().await.clear();
        {
            let mut session = self.inner.session.lock().await;
            session.connected_since = None;
            session.attempts_in_streak = 0;
        }

        if self.state() != ConnectionState::Disconnected {
            self.inner.transition(ConnectionEvent::new(
                ConnectionState::Disconnected,
                "Disconnected by client",
            ));
        }

        if let Err(e) = &result {
            warn!("Transport reported an error while disconnecting: {}", e);
        }
        result
    }

    /// Subscribe to a topic filter. Replaces the QoS of an existing entry.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        subscribe_inner(&self.inner, topic, qos).await
    }

    /// Remove a topic filter. Best-effort at the transport level.
    pub async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        self.inner.subscriptions.lock().await.remove(topic);

        if !self.inner.transport.is_connected() {
            return Ok(());
        }

        match self.inner.transport.unsubscribe(topic).await {
            Ok(()) => {
                debug!(topic = %topic, "Unsubscribed");
                Ok(())
            }
            Err(e) => {
                warn!(topic = %topic, "Unsubscribe failed: {}", e);
                Err(match e {
                    MqttError::UnknownError { .. } => e,
                    other => MqttError::unknown(other.to_string()),
                })
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver always holding the latest state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Stream of state transitions (drop-oldest)
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Stream of inbound messages (drop-oldest)
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RawMessage> {
        self.inner.messages_tx.subscribe()
    }

    /// Registered subscriptions, sorted by topic
    pub async fn active_subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .inner
            .subscriptions
            .lock()
            .await
            .values()
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.topic.cmp(&b.topic));
        subscriptions
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        let session = self.inner.session.lock().await;
        let connected = self.inner.transport.is_connected();
        let uptime_ms = match (connected, session.connected_since) {
            (true, Some(since)) => since.elapsed().as_millis() as u64,
            _ => 0,
        };

        ConnectionStats {
            connected,
            uptime_ms,
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            messages_lost: self.inner.messages_lost.load(Ordering::Relaxed),
            reconnect_count: self.inner.reconnect_count.load(Ordering::Relaxed),
            last_error: session.last_error.clone(),
            broker_host: session
                .broker
                .as_ref()
                .map(|broker| broker.host.clone())
                .unwrap_or_default(),
            client_id: session.client_id.clone(),
        }
    }

    /// Delay the next reconnect attempt would wait
    pub async fn current_backoff(&self) -> Duration {
        self.inner.session.lock().await.backoff.current()
    }

    /// Count a message dropped after ingestion (e.g. unparsable payload)
    pub fn record_message_lost(&self) {
        self.inner.messages_lost.fetch_add(1, Ordering::Relaxed);
    }
}

impl Inner {
    /// Single writer of the state; every transition is broadcast
    fn transition(&self, event: ConnectionEvent) {
        let previous = self.state_tx.send_replace(event.state.clone());
        log_state_transition(&previous, &event.state);
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }
}

/// Log connection state transition (pure logging function)
fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT connection established");
        }
        (ConnectionState::Connected, ConnectionState::Error(reason)) => {
            warn!("MQTT connection lost: {}", reason);
        }
        (_, ConnectionState::Error(reason)) => {
            warn!("MQTT connection attempt failed: {}", reason);
        }
        _ => {
            info!("MQTT connection state: {} -> {}", from, to);
        }
    }
}

/// One connection attempt. Caller holds `op_lock`.
async fn try_connect(inner: &Arc<Inner>, broker: &BrokerConfig) -> MqttResult<()> {
    inner.transition(ConnectionEvent::new(
        ConnectionState::Connecting,
        format!("Connecting to {}", broker.broker_url()),
    ));

    let client_id = generate_client_id(&inner.options.client_id_prefix);
    let options = ConnectOptions {
        broker: broker.clone(),
        client_id: client_id.clone(),
        keep_alive: inner.options.keep_alive,
        clean_session: inner.options.clean_session,
        connect_timeout: inner.options.connect_timeout,
    };
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

    if let Err(e) = inner.transport.connect(&options, inbound_tx).await {
        let reason = e.to_string();
        inner.session.lock().await.last_error = Some(reason.clone());
        inner.transition(
            ConnectionEvent::new(ConnectionState::Error(reason.clone()), "Connection failed")
                .with_cause(reason),
        );
        return Err(e);
    }

    {
        let mut session = inner.session.lock().await;
        session.client_id = client_id.clone();
        session.connected_since = Some(Instant::now());
        session.backoff.reset();
        session.attempts_in_streak = 0;
    }
    inner.reconnect_count.store(0, Ordering::Relaxed);

    let pump = spawn_pump(inner.clone(), inbound_rx);
    if let Some(previous) = inner.pump.lock().await.replace(pump) {
        previous.abort();
    }

    inner.transition(ConnectionEvent::new(
        ConnectionState::Connected,
        format!("Connected to {} as {}", broker.broker_url(), client_id),
    ));

    resubscribe_all(inner).await;
    Ok(())
}

async fn subscribe_inner(inner: &Inner, topic: &str, qos: QoS) -> MqttResult<()> {
    validate_topic_filter(topic).map_err(|e| MqttError::subscription_failed(topic, e.to_string()))?;

    if !inner.transport.is_connected() {
        return Err(MqttError::subscription_failed(topic, "not connected"));
    }

    inner
        .transport
        .subscribe(topic, qos)
        .await
        .map_err(|e| match e {
            MqttError::SubscriptionFailed { .. } => e,
            other => MqttError::subscription_failed(topic, other.to_string()),
        })?;

    inner.subscriptions.lock().await.insert(
        topic.to_string(),
        Subscription {
            topic: topic.to_string(),
            qos,
            active: true,
        },
    );
    info!(topic = %topic, qos = ?qos, "Subscribed");
    Ok(())
}

/// Replay the subscription set on a fresh session. Failures are logged and
/// do not stop the remaining topics; a topic that fails leaves the set.
///
/// Entries stay registered (inactive) until their own replay resolves, so an
/// interrupted replay can be resumed by the next session.
async fn resubscribe_all(inner: &Inner) {
    let snapshot: Vec<Subscription> = {
        let mut subscriptions = inner.subscriptions.lock().await;
        subscriptions
            .values_mut()
            .map(|subscription| {
                subscription.active = false;
                subscription.clone()
            })
            .collect()
    };

    if snapshot.is_empty() {
        return;
    }

    info!("Re-subscribing to {} topics", snapshot.len());
    for subscription in snapshot {
        if !inner.transport.is_connected() {
            warn!("Session ended during re-subscription, remaining topics kept for the next one");
            break;
        }
        if let Err(e) = subscribe_inner(inner, &subscription.topic, subscription.qos).await {
            if !inner.transport.is_connected() {
                warn!(topic = %subscription.topic, "Session ended before re-subscription was acknowledged");
                break;
            }
            error!("Failed to re-subscribe to {}: {}", subscription.topic, e);
            inner.subscriptions.lock().await.remove(&subscription.topic);
        }
    }
}

/// Spawn the task turning transport events into raw messages and state changes
fn spawn_pump(inner: Arc<Inner>, inbound_rx: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
    tokio::spawn(run_pump(inner, inbound_rx))
}

async fn run_pump(inner: Arc<Inner>, mut inbound_rx: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = inbound_rx.recv().await {
        match event {
            TransportEvent::Message {
                topic,
                payload,
                qos,
                retain,
            } => match RawMessage::from_frame(topic, &payload, qos, retain) {
                Ok(message) => {
                    debug!(topic = %message.topic, bytes = payload.len(), "Message received");
                    // No receivers is fine
                    let _ = inner.messages_tx.send(message);
                    inner.messages_received.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    inner.messages_lost.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping frame with undecodable payload: {}", e);
                }
            },
            TransportEvent::ConnectionLost(reason) => {
                handle_connection_lost(&inner, reason).await;
                break;
            }
        }
    }
}

async fn handle_connection_lost(inner: &Arc<Inner>, reason: String) {
    let _guard = inner.op_lock.lock().await;

    if !inner.state_tx.borrow().is_connected() {
        debug!("Ignoring connection loss outside a live session: {}", reason);
        return;
    }

    {
        let mut subscriptions = inner.subscriptions.lock().await;
        for subscription in subscriptions.values_mut() {
            subscription.active = false;
        }
    }
    {
        let mut session = inner.session.lock().await;
        session.connected_since = None;
        session.last_error = Some(reason.clone());
    }

    inner.transition(
        ConnectionEvent::new(ConnectionState::Error(reason.clone()), "Connection lost")
            .with_cause(reason),
    );

    if inner.options.reconnect.auto_reconnect {
        start_reconnect(inner).await;
    }
}

/// Start the reconnect loop unless one is running. Caller holds `op_lock`.
async fn start_reconnect(inner: &Arc<Inner>) {
    let mut slot = inner.reconnect.lock().await;
    if let Some(existing) = slot.as_ref() {
        if !existing.handle.is_finished() {
            return;
        }
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = spawn_reconnect_loop(inner.clone(), cancel_rx);
    *slot = Some(ReconnectHandle { cancel_tx, handle });
}

/// Ask the reconnect loop to stop at its next check. The loop is not
/// aborted, so a connect-and-replay step in progress runs to completion.
async fn signal_reconnect_cancel(inner: &Inner) {
    if let Some(reconnect) = inner.reconnect.lock().await.as_ref() {
        let _ = reconnect.cancel_tx.send(true);
    }
}

/// Cancel and abort the reconnect loop, if any. Caller holds `op_lock`, so
/// the loop is either waiting or sleeping, never mid-connect.
async fn stop_reconnect(inner: &Inner) {
    if let Some(reconnect) = inner.reconnect.lock().await.take() {
        let _ = reconnect.cancel_tx.send(true);
        reconnect.handle.abort();
        debug!("Reconnect loop cancelled");
    }
}

fn spawn_reconnect_loop(inner: Arc<Inner>, cancel_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(run_reconnect_loop(inner, cancel_rx))
}

async fn run_reconnect_loop(inner: Arc<Inner>, mut cancel_rx: watch::Receiver<bool>) {
    loop {
        let cancelled = *cancel_rx.borrow();
        let (decision, broker) = {
            let session = inner.session.lock().await;
            (
                should_attempt_reconnection(
                    session.attempts_in_streak,
                    &session.backoff,
                    cancelled,
                    session.broker.is_some(),
                ),
                session.broker.clone(),
            )
        };

        let (attempt, delay, broker) = match (decision, broker) {
            (ReconnectDecision::Proceed { attempt, delay }, Some(broker)) => {
                (attempt, delay, broker)
            }
            (ReconnectDecision::AbortCancelled, _) => {
                info!("Reconnect loop cancelled");
                return;
            }
            _ => {
                error!("No broker configuration stored, stopping reconnect loop");
                return;
            }
        };

        inner.transition(
            ConnectionEvent::new(
                ConnectionState::Reconnecting,
                format!("Reconnect attempt {} in {}ms", attempt, delay.as_millis()),
            )
            .with_delay(delay),
        );

        if !interruptible_sleep(&mut cancel_rx, delay).await {
            info!("Reconnect loop cancelled during backoff");
            return;
        }

        let guard = inner.op_lock.lock().await;
        if *cancel_rx.borrow() {
            return;
        }

        match try_connect(&inner, &broker).await {
            Ok(()) => {
                info!(attempt, "Reconnection successful");
                // Release the slot while still holding op_lock so a loss on
                // the new session can start a fresh loop
                inner.reconnect.lock().await.take();
                drop(guard);
                return;
            }
            Err(e) => {
                let next_delay = {
                    let mut session = inner.session.lock().await;
                    session.attempts_in_streak = attempt;
                    session.backoff.on_failure()
                };
                inner.reconnect_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempt,
                    next_delay_ms = next_delay.as_millis() as u64,
                    "Reconnect attempt failed: {}",
                    e
                );
            }
        }
        drop(guard);
    }
}

/// Sleep unless cancelled first. Returns false when cancelled.
async fn interruptible_sleep(cancel_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return false;
                }
            }
            _ = &mut sleep => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut cancel_rx, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = cancel_tx.send(true);
        });

        let started = Instant::now();
        let completed = interruptible_sleep(&mut cancel_rx, Duration::from_secs(10)).await;

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_sender_dropped() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        drop(cancel_tx);
        assert!(!interruptible_sleep(&mut cancel_rx, Duration::from_secs(10)).await);
    }

    #[test]
    fn test_manager_options_from_config() {
        let config = LiveConfig::for_broker("h", 1883);
        let options = ManagerOptions::from(&config);
        assert_eq!(options.client_id_prefix, "vibus");
        assert_eq!(options.event_buffer, 10);
        assert_eq!(options.message_buffer, 50);
        assert_eq!(options.reconnect.base_delay, Duration::from_secs(1));
    }
}
