//! Shared helpers for broker-free integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use vibus_live::config::{BrokerConfig, LiveConfig};
use vibus_live::testing::MockTransport;
use vibus_live::transport::mqtt::{
    ConnectionEvent, ConnectionManager, ConnectionState, ManagerOptions, ReconnectConfig,
};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn broker() -> BrokerConfig {
    BrokerConfig::new("localhost", 1883, false)
}

/// Manager options with a 20ms..80ms backoff and roomy buffers
pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        reconnect: ReconnectConfig {
            auto_reconnect: true,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(80),
        },
        event_buffer: 64,
        message_buffer: 64,
        connect_timeout: Duration::from_secs(1),
        ..ManagerOptions::default()
    }
}

pub fn manager_with(transport: &Arc<MockTransport>, options: ManagerOptions) -> ConnectionManager {
    ConnectionManager::with_options(transport.clone(), options)
}

/// Service configuration with a fast reconnect policy
pub fn fast_config() -> LiveConfig {
    let mut config = LiveConfig::for_broker("localhost", 1883);
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_delay_ms = 80;
    config.channels.event_buffer = 64;
    config.channels.message_buffer = 64;
    config
}

pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event stream closed")
}

/// Skip events until one matches `predicate`
pub async fn event_matching<F>(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    mut predicate: F,
) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}

pub async fn wait_for_connected(state: &mut watch::Receiver<ConnectionState>) {
    timeout(WAIT, state.wait_for(|state| state.is_connected()))
        .await
        .expect("timed out waiting for Connected")
        .expect("state channel closed");
}

/// Poll `check` until it holds or the wait expires
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
