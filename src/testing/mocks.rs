//! Mock implementations for testing
//!
//! Provides a scriptable [`Transport`] so the connection manager and the
//! service can be exercised without a broker.

use crate::error::{MqttError, MqttResult};
use crate::transport::{ConnectOptions, Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    always_fail: AtomicBool,
    fail_next: AtomicU32,
    fail_subscribe: AtomicBool,
    failing_topics: Mutex<HashSet<String>>,
    subscribe_delay_ms: AtomicU64,
    connect_attempts: AtomicU32,
    connected: AtomicBool,
    inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    last_options: Mutex<Option<ConnectOptions>>,
    subscribe_calls: Mutex<Vec<(String, QoS)>>,
    unsubscribe_calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose every connect fails as unreachable
    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.set_always_fail(true);
        transport
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` connects, then succeed
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Refuse subscriptions to `topic` only
    pub async fn fail_subscribe_for(&self, topic: &str) {
        self.failing_topics.lock().await.insert(topic.to_string());
    }

    /// Make every subscribe take `delay` before completing
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.subscribe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn last_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().await.clone()
    }

    /// Every subscribe call that reached the transport, in order
    pub async fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.subscribe_calls.lock().await.clone()
    }

    pub async fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribe_calls.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.subscribe_calls.lock().await.clear();
        self.unsubscribe_calls.lock().await.clear();
    }

    /// Deliver a message as if it came from the broker. Returns false without a session.
    pub async fn inject_message(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let sender = self.inbound.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.into(),
                    qos: 1,
                    retain: false,
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    /// End the session from the broker side
    pub async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sender) = self.inbound.lock().await.take() {
            let _ = sender
                .send(TransportEvent::ConnectionLost(reason.to_string()))
                .await;
        }
    }

    fn should_fail_connect(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: mpsc::Sender<TransportEvent>,
    ) -> MqttResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().await = Some(options.clone());

        if self.should_fail_connect() {
            return Err(MqttError::broker_unreachable(options.broker.broker_url()));
        }

        *self.inbound.lock().await = Some(inbound);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> MqttResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().await.take();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        let delay = self.subscribe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::subscription_failed(topic, "not connected"));
        }
        if self.fail_subscribe.load(Ordering::SeqCst)
            || self.failing_topics.lock().await.contains(topic)
        {
            return Err(MqttError::subscription_failed(topic, "Mock subscribe failure"));
        }
        self.subscribe_calls
            .lock()
            .await
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        self.unsubscribe_calls.lock().await.push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
