//! Impure I/O operations for the MQTT client
//!
//! This module owns the rumqttc client and event loop of the current
//! session. Reconnection is not left to rumqttc: a failed event loop ends
//! the session and the [`ConnectionManager`](super::ConnectionManager)
//! decides when to open a new one.
//!
//! `subscribe` resolves on the broker's SUBACK, not when the request is
//! queued. Requests are matched to acknowledgements through the packet id
//! rumqttc reports when the SUBSCRIBE goes out.

use super::connection::{configure_mqtt_options, ConnectOptions};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::{MqttError, MqttResult};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request queue
const REQUEST_QUEUE_CAPACITY: usize = 10;

/// How long `disconnect` waits for the event loop task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type SubAckSender = oneshot::Sender<Result<(), String>>;

/// SUBSCRIBE requests waiting for their SUBACK
///
/// rumqttc assigns packet ids inside the event loop, so a request waits in
/// `queued` (in submission order) until its `Outgoing::Subscribe` is seen.
#[derive(Default)]
struct PendingSubAcks {
    queued: VecDeque<SubAckSender>,
    in_flight: HashMap<u16, SubAckSender>,
}

impl PendingSubAcks {
    fn enqueue(&mut self) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    /// Forget the most recent request, which never reached the queue
    fn withdraw_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, packet_id: u16) {
        match self.queued.pop_front() {
            Some(tx) => {
                self.in_flight.insert(packet_id, tx);
            }
            None => warn!("SUBSCRIBE {} sent with no waiting caller", packet_id),
        }
    }

    fn acknowledged(&mut self, packet_id: u16, outcome: Result<(), String>) {
        if let Some(tx) = self.in_flight.remove(&packet_id) {
            let _ = tx.send(outcome);
        }
    }

    /// Drop every waiter; their callers see the session end
    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

struct Session {
    client: AsyncClient,
    pending: Arc<Mutex<PendingSubAcks>>,
    ack_timeout: Duration,
    closing: Arc<AtomicBool>,
    event_loop_handle: JoinHandle<()>,
    broker_url: String,
}

/// rumqttc-backed MQTT 3.1.1 transport
pub struct RumqttTransport {
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Poll the event loop until the broker acknowledges the session
    async fn wait_for_connack(event_loop: &mut EventLoop, broker_url: &str) -> MqttResult<()> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| Self::map_connection_error(e, broker_url))?;

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                EventRoute::ConnectionRefused(code) => {
                    if MessageHandler::is_authentication_failure(code) {
                        return Err(MqttError::authentication_failed(broker_url));
                    }
                    return Err(MqttError::connection_failed(format!(
                        "Broker refused connection: {code:?}"
                    )));
                }
                route => {
                    debug!(target: "mqtt_transport", "Pre-ConnAck event: {:?}", route);
                }
            }
        }
    }

    /// Convert a rumqttc connection error into the crate taxonomy
    fn map_connection_error(error: ConnectionError, broker_url: &str) -> MqttError {
        match error {
            ConnectionError::ConnectionRefused(code)
                if MessageHandler::is_authentication_failure(code) =>
            {
                MqttError::authentication_failed(broker_url)
            }
            ConnectionError::Io(e) => {
                debug!(target: "mqtt_transport", "I/O error reaching {}: {}", broker_url, e);
                MqttError::broker_unreachable(broker_url)
            }
            ConnectionError::NetworkTimeout => MqttError::broker_unreachable(broker_url),
            other => MqttError::connection_failed(other.to_string()),
        }
    }

    /// Drive the session's event loop, forwarding inbound traffic
    async fn run_event_loop(
        mut event_loop: EventLoop,
        inbound: mpsc::Sender<TransportEvent>,
        pending: Arc<Mutex<PendingSubAcks>>,
        connected: Arc<AtomicBool>,
        closing: Arc<AtomicBool>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    match &route {
                        EventRoute::SubscribeSent { packet_id } => {
                            pending.lock().await.sent(*packet_id);
                        }
                        EventRoute::SubscriptionConfirmed { packet_id } => {
                            debug!(target: "mqtt_transport", "Subscription {} confirmed", packet_id);
                            pending.lock().await.acknowledged(*packet_id, Ok(()));
                        }
                        EventRoute::SubscriptionRejected { packet_id } => {
                            warn!("Broker rejected subscription request {}", packet_id);
                            pending
                                .lock()
                                .await
                                .acknowledged(*packet_id, Err("rejected by broker".to_string()));
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            debug!(target: "mqtt_transport", "MQTT event: {}", event);
                        }
                        _ => {}
                    }

                    let ends_session = matches!(route, EventRoute::Disconnected);
                    if let Some(transport_event) = route.into_transport_event() {
                        if ends_session {
                            connected.store(false, Ordering::SeqCst);
                        }
                        if inbound.send(transport_event).await.is_err() {
                            debug!(target: "mqtt_transport", "Inbound receiver dropped, stopping event loop");
                            break;
                        }
                    }
                    if ends_session {
                        break;
                    }
                }
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    if closing.load(Ordering::SeqCst) {
                        debug!(target: "mqtt_transport", "Event loop closed: {}", e);
                    } else {
                        error!("MQTT event loop error: {}", e);
                        let _ = inbound.send(TransportEvent::ConnectionLost(e.to_string())).await;
                    }
                    break;
                }
            }
        }
        pending.lock().await.clear();
        debug!(target: "mqtt_transport", "MQTT event loop stopped");
    }

    /// Tear down a session, waiting briefly for its event loop task
    async fn close_session(session: Session) -> MqttResult<()> {
        session.closing.store(true, Ordering::SeqCst);
        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| MqttError::connection_failed(format!("Disconnect failed: {e}")));

        let mut handle = session.event_loop_handle;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                handle.abort();
            }
            _ => {}
        }

        info!(broker = %session.broker_url, "MQTT session closed");
        result
    }

    async fn connected_client(&self) -> Option<AsyncClient> {
        self.connected_session()
            .await
            .map(|(client, _, _)| client)
    }

    async fn connected_session(
        &self,
    ) -> Option<(AsyncClient, Arc<Mutex<PendingSubAcks>>, Duration)> {
        if !self.is_connected() {
            return None;
        }
        self.session.lock().await.as_ref().map(|session| {
            (
                session.client.clone(),
                session.pending.clone(),
                session.ack_timeout,
            )
        })
    }
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: mpsc::Sender<TransportEvent>,
    ) -> MqttResult<()> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            self.connected.store(false, Ordering::SeqCst);
            let _ = Self::close_session(previous).await;
        }

        let broker_url = options.broker.broker_url();
        let mqtt_options = configure_mqtt_options(options);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_QUEUE_CAPACITY);

        info!(
            broker = %broker_url,
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        match tokio::time::timeout(
            options.connect_timeout,
            Self::wait_for_connack(&mut event_loop, &broker_url),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(broker = %broker_url, "ConnAck timeout - no connection confirmation received");
                return Err(MqttError::broker_unreachable(broker_url));
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        let closing = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(Mutex::new(PendingSubAcks::default()));
        let event_loop_handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            inbound,
            pending.clone(),
            self.connected.clone(),
            closing.clone(),
        ));

        *slot = Some(Session {
            client,
            pending,
            ack_timeout: options.connect_timeout,
            closing,
            event_loop_handle,
            broker_url,
        });
        Ok(())
    }

    async fn disconnect(&self) -> MqttResult<()> {
        let session = self.session.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        match session {
            Some(session) => Self::close_session(session).await,
            None => Ok(()),
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        let (client, pending, ack_timeout) = self
            .connected_session()
            .await
            .ok_or_else(|| MqttError::subscription_failed(topic, "not connected"))?;

        // Enqueue and submit under one lock so waiters line up with packet ids
        let ack = {
            let mut pending = pending.lock().await;
            let ack = pending.enqueue();
            if let Err(e) = client.try_subscribe(topic, qos) {
                pending.withdraw_last();
                return Err(MqttError::subscription_failed(topic, e.to_string()));
            }
            ack
        };

        match tokio::time::timeout(ack_timeout, ack).await {
            Ok(Ok(outcome)) => {
                outcome.map_err(|reason| MqttError::subscription_failed(topic, reason))
            }
            Ok(Err(_)) => Err(MqttError::subscription_failed(
                topic,
                "session ended before SUBACK",
            )),
            Err(_) => {
                warn!(topic = %topic, "No SUBACK within {:?}", ack_timeout);
                Err(MqttError::subscription_failed(topic, "SUBACK timeout"))
            }
        }
    }

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        let Some(client) = self.connected_client().await else {
            return Ok(());
        };
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::unknown(format!("Unsubscribe from '{topic}' failed: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        // Can't await in Drop; only make sure the event loop task stops
        if let Some(session) = self.session.get_mut().take() {
            session.closing.store(true, Ordering::SeqCst);
            session.event_loop_handle.abort();
        }
    }
}
