//! Auto-reconnect, backoff and subscription replay

mod common;

use common::{broker, event_matching, fast_options, manager_with, next_event, wait_for_connected};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use vibus_live::testing::MockTransport;
use vibus_live::transport::mqtt::{ConnectionState, ManagerOptions, ReconnectConfig};
use vibus_live::MqttError;

#[tokio::test]
async fn test_unreachable_broker_schedules_reconnect() {
    // Arrange
    let transport = Arc::new(MockTransport::with_failure());
    let manager = manager_with(&transport, fast_options());
    let mut events = manager.subscribe_events();

    // Act
    let result = manager.connect(broker()).await;

    // Assert
    assert!(matches!(result, Err(MqttError::BrokerUnreachable { .. })));
    assert_eq!(next_event(&mut events).await.state, ConnectionState::Connecting);
    let failed = next_event(&mut events).await;
    assert!(matches!(failed.state, ConnectionState::Error(_)));
    assert!(failed.cause.is_some());

    let scheduled = next_event(&mut events).await;
    assert_eq!(scheduled.state, ConnectionState::Reconnecting);
    assert_eq!(scheduled.reconnect_delay, Some(Duration::from_millis(20)));

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_backoff_doubles_up_to_ceiling() {
    let transport = Arc::new(MockTransport::with_failure());
    let manager = manager_with(&transport, fast_options());
    let mut events = manager.subscribe_events();

    let _ = manager.connect(broker()).await;

    let mut delays = Vec::new();
    while delays.len() < 4 {
        let event = event_matching(&mut events, |event| {
            event.state == ConnectionState::Reconnecting
        })
        .await;
        delays.push(event.reconnect_delay.unwrap());
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80),
            Duration::from_millis(80),
        ]
    );
    assert!(manager.connection_stats().await.reconnect_count >= 3);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_recovery_resets_backoff_and_counters() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    transport.fail_next_connects(3);
    let manager = manager_with(&transport, fast_options());
    let mut state = manager.subscribe_state();

    // Act
    assert!(manager.connect(broker()).await.is_err());
    wait_for_connected(&mut state).await;

    // Assert
    assert_eq!(transport.connect_attempts(), 4);
    assert_eq!(manager.current_backoff().await, Duration::from_millis(20));
    let stats = manager.connection_stats().await;
    assert!(stats.connected);
    assert_eq!(stats.reconnect_count, 0);
}

#[tokio::test]
async fn test_resubscribes_after_connection_loss() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let manager = manager_with(&transport, fast_options());
    let mut events = manager.subscribe_events();
    manager.connect(broker()).await.unwrap();
    manager
        .subscribe("vibus/autobus/+/posizione", QoS::AtLeastOnce)
        .await
        .unwrap();
    manager
        .subscribe("vibus/linea/+/statistiche", QoS::AtMostOnce)
        .await
        .unwrap();
    transport.clear_history().await;

    // Act
    transport.drop_connection("broker restarted").await;

    // Assert
    let lost = event_matching(&mut events, |event| {
        matches!(event.state, ConnectionState::Error(_))
    })
    .await;
    assert_eq!(lost.cause.as_deref(), Some("broker restarted"));
    event_matching(&mut events, |event| event.state == ConnectionState::Connected).await;

    let replayed = common::eventually(|| {
        let transport = transport.clone();
        async move { transport.subscribe_calls().await.len() == 2 }
    })
    .await;
    assert!(replayed);

    let mut calls = transport.subscribe_calls().await;
    calls.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        calls,
        vec![
            ("vibus/autobus/+/posizione".to_string(), QoS::AtLeastOnce),
            ("vibus/linea/+/statistiche".to_string(), QoS::AtMostOnce),
        ]
    );
    assert!(manager
        .active_subscriptions()
        .await
        .iter()
        .all(|subscription| subscription.active));
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    // Arrange
    let transport = Arc::new(MockTransport::with_failure());
    let options = ManagerOptions {
        reconnect: ReconnectConfig {
            auto_reconnect: true,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        },
        ..fast_options()
    };
    let manager = manager_with(&transport, options);
    let mut events = manager.subscribe_events();
    let _ = manager.connect(broker()).await;
    event_matching(&mut events, |event| event.state == ConnectionState::Reconnecting).await;

    // Act
    manager.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Assert
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_no_reconnect_when_disabled() {
    let transport = Arc::new(MockTransport::with_failure());
    let options = ManagerOptions {
        reconnect: ReconnectConfig {
            auto_reconnect: false,
            ..fast_options().reconnect
        },
        ..fast_options()
    };
    let manager = manager_with(&transport, options);

    assert!(manager.connect(broker()).await.is_err());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(transport.connect_attempts(), 1);
    assert!(matches!(manager.state(), ConnectionState::Error(_)));
}

#[tokio::test]
async fn test_connection_loss_marks_subscriptions_inactive() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let options = ManagerOptions {
        reconnect: ReconnectConfig {
            auto_reconnect: false,
            ..fast_options().reconnect
        },
        ..fast_options()
    };
    let manager = manager_with(&transport, options);
    let mut events = manager.subscribe_events();
    manager.connect(broker()).await.unwrap();
    manager
        .subscribe("vibus/sistema/+/stato", QoS::AtLeastOnce)
        .await
        .unwrap();

    // Act
    transport.drop_connection("keep-alive timeout").await;
    event_matching(&mut events, |event| {
        matches!(event.state, ConnectionState::Error(_))
    })
    .await;

    // Assert
    let subscriptions = manager.active_subscriptions().await;
    assert_eq!(subscriptions.len(), 1);
    assert!(!subscriptions[0].active);
    let stats = manager.connection_stats().await;
    assert!(!stats.connected);
    assert_eq!(stats.last_error.as_deref(), Some("keep-alive timeout"));
}

#[tokio::test]
async fn test_manual_connect_during_replay_keeps_subscriptions() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let manager = manager_with(&transport, fast_options());
    let mut events = manager.subscribe_events();
    manager.connect(broker()).await.unwrap();
    manager
        .subscribe("vibus/autobus/+/posizione", QoS::AtLeastOnce)
        .await
        .unwrap();
    manager
        .subscribe("vibus/sistema/+/stato", QoS::AtLeastOnce)
        .await
        .unwrap();
    transport.set_subscribe_delay(Duration::from_millis(200));

    // Act
    transport.drop_connection("broker restarted").await;
    event_matching(&mut events, |event| event.state == ConnectionState::Connected).await;
    let result = manager.connect(broker()).await;

    // Assert
    assert!(result.is_ok());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(transport.connect_attempts(), 2);
    let subscriptions = manager.active_subscriptions().await;
    assert_eq!(subscriptions.len(), 2);
    assert!(subscriptions.iter().all(|subscription| subscription.active));
}

#[tokio::test]
async fn test_failed_resubscription_does_not_stop_the_rest() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let manager = manager_with(&transport, fast_options());
    manager.connect(broker()).await.unwrap();
    for (topic, qos) in [
        ("vibus/autobus/+/posizione", QoS::AtLeastOnce),
        ("vibus/linea/+/statistiche", QoS::AtMostOnce),
        ("vibus/sistema/+/stato", QoS::AtLeastOnce),
    ] {
        manager.subscribe(topic, qos).await.unwrap();
    }
    transport.clear_history().await;
    transport.fail_subscribe_for("vibus/linea/+/statistiche").await;

    // Act
    transport.drop_connection("broker restarted").await;

    // Assert
    let replayed = common::eventually(|| {
        let manager = manager.clone();
        async move {
            let subscriptions = manager.active_subscriptions().await;
            subscriptions.len() == 2 && subscriptions.iter().all(|s| s.active)
        }
    })
    .await;
    assert!(replayed, "replay did not settle on the two accepted topics");

    // The refused topic leaves the set; the others keep their QoS
    let topics: Vec<(String, QoS)> = manager
        .active_subscriptions()
        .await
        .into_iter()
        .map(|subscription| (subscription.topic, subscription.qos))
        .collect();
    assert_eq!(
        topics,
        vec![
            ("vibus/autobus/+/posizione".to_string(), QoS::AtLeastOnce),
            ("vibus/sistema/+/stato".to_string(), QoS::AtLeastOnce),
        ]
    );
    assert_eq!(transport.subscribe_calls().await.len(), 2);
}
