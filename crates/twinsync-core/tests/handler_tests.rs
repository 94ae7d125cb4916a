//! Handler lifecycle: connect, reconnect, disposal

mod common;

use common::{config, descriptor, eventually, Fixture, CHANGES, QUEUE};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twinsync_core::{
    ConfigError, ConsumerConfig, CooldownPolicy, DataType, HandlerState, ObservationMessage,
    TwinError, TwinHandler,
};

#[tokio::test]
async fn test_unknown_consumer_type_is_fatal_at_construction() {
    let fx = Fixture::new();
    let result = TwinHandler::new(
        "bad",
        descriptor(),
        ConsumerConfig {
            consumer_type: "Setting".to_string(),
            ..config(1)
        },
        Arc::new(fx.broker.clone()),
        Arc::clone(&fx.cache),
        Arc::new(fx.store.clone()),
    );

    assert!(matches!(result, Err(ConfigError::UnknownConsumerType(t)) if t == "Setting"));
    assert!(TwinError::from(ConfigError::UnknownConsumerType("x".into())).is_fatal());
    assert_eq!(fx.broker.connection_attempts(), 0);
}

#[tokio::test]
async fn test_run_connects_and_registers_consumer() {
    let fx = Fixture::new();
    let mut handler = fx.handler(config(1));
    assert_eq!(handler.state(), HandlerState::Disconnected);

    handler.run().await.unwrap();
    assert_eq!(handler.state(), HandlerState::Running);
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);
    assert_eq!(fx.broker.open_connections(), 1);

    // Steady state does not reconnect
    handler.run().await.unwrap();
    handler.run().await.unwrap();
    assert_eq!(fx.broker.connection_attempts(), 1);

    handler.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_waits_cooldown_and_retries() {
    let fx = Fixture::new();
    fx.broker.set_reachable(false);
    let mut handler = fx.handler(config(1));

    let started = tokio::time::Instant::now();
    handler.run().await.unwrap();
    assert_eq!(handler.state(), HandlerState::Disconnected);
    assert!(started.elapsed() >= Duration::from_secs(2));

    handler.run().await.unwrap();
    assert_eq!(fx.broker.connection_attempts(), 2);
    assert_eq!(handler.state(), HandlerState::Disconnected);

    fx.broker.set_reachable(true);
    handler.run().await.unwrap();
    assert_eq!(handler.state(), HandlerState::Running);
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);

    handler.dispose().await;
}

#[tokio::test]
async fn test_missing_queue_closes_half_open_connection() {
    let fx = Fixture::new();
    let mut handler = fx.handler(ConsumerConfig {
        queue: "not-declared".to_string(),
        reconnect_cooldown_secs: 0,
        ..config(1)
    });

    handler.run().await.unwrap();
    assert_eq!(handler.state(), HandlerState::Disconnected);
    assert_eq!(fx.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_reconnects_after_broker_drops_connection() {
    let fx = Fixture::new();
    let mut handler = fx.handler(config(1));
    handler.run().await.unwrap();

    fx.broker.sever_connections().await;
    assert_eq!(fx.broker.consumer_count(QUEUE), 0);

    handler.run().await.unwrap();
    assert_eq!(handler.state(), HandlerState::Disconnected);

    handler.run().await.unwrap();
    assert_eq!(handler.state(), HandlerState::Running);
    assert_eq!(fx.broker.connection_attempts(), 2);

    // Deliveries flow again on the new connection
    fx.publish(&ObservationMessage::new("D1", 5, DataType::Integer, json!(9)));
    eventually(|| fx.store.observation_count() == 1).await;

    handler.dispose().await;
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_leaves_no_subscriptions() {
    let fx = Fixture::new();
    let mut handler = fx.handler(ConsumerConfig {
        notification_queue: Some(CHANGES.to_string()),
        ..config(1)
    });
    handler.run().await.unwrap();
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);
    assert_eq!(fx.broker.consumer_count(CHANGES), 1);

    handler.dispose().await;
    handler.dispose().await;

    assert!(handler.is_disposed());
    assert_eq!(handler.state(), HandlerState::Disconnected);
    assert_eq!(fx.broker.consumer_count(QUEUE), 0);
    assert_eq!(fx.broker.consumer_count(CHANGES), 0);
    assert_eq!(fx.broker.open_connections(), 0);

    assert!(handler.run().await.is_err());
}

#[tokio::test]
async fn test_dispose_before_connecting_is_harmless() {
    let fx = Fixture::new();
    let mut handler = fx.handler(config(1));
    handler.dispose().await;
    handler.dispose().await;
    assert_eq!(fx.broker.connection_attempts(), 0);
}

#[tokio::test]
async fn test_dispose_persists_buffered_observations() {
    let fx = Fixture::new();
    let mut handler = fx.handler(config(10));
    handler.run().await.unwrap();

    fx.publish(&ObservationMessage::new("D1", 5, DataType::Integer, json!(1)));
    eventually(|| fx.broker.acked(QUEUE) == 1).await;
    assert_eq!(fx.store.observation_count(), 0);

    handler.dispose().await;
    assert_eq!(fx.store.observation_count(), 1);
}

#[tokio::test]
async fn test_unconsumed_messages_stay_queued_after_dispose() {
    let fx = Fixture::new();
    let mut handler = fx.handler(config(1));

    fx.publish(&ObservationMessage::new("D1", 5, DataType::Integer, json!(1)));
    handler.dispose().await;

    // Never consumed, still waiting for the next consumer
    assert_eq!(fx.broker.ready(QUEUE), 1);
}

#[tokio::test]
async fn test_dropping_a_running_handler_releases_the_session() {
    let fx = Fixture::new();
    let mut handler = fx.handler(config(1));
    handler.run().await.unwrap();
    assert_eq!(fx.broker.open_connections(), 1);

    drop(handler);
    eventually(|| fx.broker.open_connections() == 0).await;
    assert_eq!(fx.broker.consumer_count(QUEUE), 0);
}

struct Doubling {
    next: Duration,
    calls: Arc<AtomicUsize>,
}

impl CooldownPolicy for Doubling {
    fn next_cooldown(&mut self) -> Duration {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.next;
        self.next *= 2;
        current
    }

    fn reset(&mut self) {
        self.next = Duration::from_secs(1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_policy_is_pluggable() {
    let fx = Fixture::new();
    fx.broker.set_reachable(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut handler = fx.handler(config(1)).with_cooldown(Box::new(Doubling {
        next: Duration::from_secs(1),
        calls: Arc::clone(&calls),
    }));

    let started = tokio::time::Instant::now();
    handler.run().await.unwrap();
    handler.run().await.unwrap();
    handler.run().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_secs(7));

    handler.dispose().await;
}
