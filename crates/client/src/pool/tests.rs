use std::sync::Arc;
use std::time::Duration;

use spacelink_domain::{ConnectionState, PoolKey, ServerConfig, ServerLanguage, WireProtocol};

use super::*;
use crate::connection::{wait_for_state, ConnectionOptions};
use crate::credentials::{CredentialStore, MemoryCredentialStore};
use crate::settings::{BreakerSettings, RetrySettings};
use crate::testing::{MemoryConnector, ServerScript};

fn server() -> ServerConfig {
    ServerConfig::new(ServerLanguage::Rust, "srv", 3000, "db").with_protocol(WireProtocol::Json)
}

fn settings(max: usize, min: usize) -> PoolSettings {
    PoolSettings {
        max_connections: max,
        min_connections: min,
        acquire_timeout_ms: 2_000,
        health_check_interval_ms: 60_000,
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        },
        breaker: BreakerSettings::default(),
    }
}

fn pool_over(connector: &MemoryConnector, settings: PoolSettings) -> (ConnectionPool, PoolKey) {
    let factory = DefaultConnectionFactory::new(
        Arc::new(connector.clone()),
        Arc::new(MemoryCredentialStore::new()) as Arc<dyn CredentialStore>,
        ConnectionOptions::default(),
    );
    let pool = ConnectionPool::new(settings, Arc::new(factory)).unwrap();
    let key = pool.register(server()).unwrap();
    (pool, key)
}

// ============================================================================
// Acquire / release
// ============================================================================

#[tokio::test]
async fn ten_acquirers_share_five_connections() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.connect_latency = Duration::from_millis(200);
    let connector = MemoryConnector::new(script);
    let (pool, key) = pool_over(&connector, settings(5, 2));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool
                .acquire_with_timeout(&key, Duration::from_secs(2))
                .await?;
            assert!(conn.state().is_open());
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, ClientError>(())
        }));
    }

    // First wave connected (200ms) and still held; the other five wait
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(pool.metrics().key(&key).unwrap().active, 5);

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(connector.peak_sockets(), 5);
    assert_eq!(connector.accepted(), 5);

    let metrics = pool.metrics();
    let key_metrics = metrics.key(&key).unwrap();
    assert_eq!(key_metrics.total, 5);
    assert_eq!(key_metrics.active, 0);
    assert_eq!(key_metrics.failed, 0);
}

#[tokio::test]
async fn released_connection_is_reused() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(2, 0));

    let first_id = {
        let conn = pool.acquire(&key).await.unwrap();
        conn.id()
    };
    let conn = pool.acquire(&key).await.unwrap();

    assert_eq!(conn.id(), first_id);
    assert_eq!(connector.accepted(), 1);
}

#[tokio::test]
async fn acquire_times_out_when_every_slot_is_held() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(1, 0));

    let held = pool.acquire(&key).await.unwrap();
    let err = pool
        .acquire_with_timeout(&key, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");

    drop(held);
    let again = pool
        .acquire_with_timeout(&key, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(again.is_healthy());
    assert_eq!(connector.accepted(), 1);
}

#[tokio::test]
async fn waiting_acquirer_gets_the_released_connection() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(1, 0));

    let held = pool.acquire(&key).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let key = key.clone();
        tokio::spawn(async move { pool.acquire(&key).await.map(|c| c.id()) })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let held_id = held.id();
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
}

#[tokio::test]
async fn panicking_holder_still_releases() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(1, 0));

    let task = {
        let pool = pool.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let _conn = pool.acquire(&key).await.unwrap();
            panic!("caller bug");
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert_eq!(pool.metrics().active(), 0);
    pool.acquire_with_timeout(&key, Duration::from_millis(200))
        .await
        .unwrap();
}

#[tokio::test]
async fn reported_failure_evicts_the_connection() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(2, 0));

    let mut conn = pool.acquire(&key).await.unwrap();
    conn.report_failure();
    drop(conn);

    let metrics = pool.metrics();
    let key_metrics = metrics.key(&key).unwrap();
    assert_eq!(key_metrics.total, 0);
    assert_eq!(key_metrics.failed, 1);
    assert_eq!(key_metrics.evicted, 1);
}

#[tokio::test]
async fn unknown_key_is_a_configuration_error() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, _) = pool_over(&connector, settings(1, 0));

    let err = pool
        .acquire(&PoolKey::new("ws://elsewhere:1", "arena"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Configuration(_)));
}

#[test]
fn invalid_settings_are_rejected() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let factory = DefaultConnectionFactory::new(
        Arc::new(connector),
        Arc::new(MemoryCredentialStore::new()),
        ConnectionOptions::default(),
    );
    let err = ConnectionPool::new(settings(1, 3), Arc::new(factory)).unwrap_err();
    assert!(matches!(err, ClientError::Configuration(_)));
}

// ============================================================================
// Retry and circuit breaking
// ============================================================================

#[tokio::test]
async fn transient_connect_failures_are_retried() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.fail_first = 2;
    let connector = MemoryConnector::new(script);
    let (pool, key) = pool_over(&connector, settings(1, 0));

    let conn = pool.acquire(&key).await.unwrap();

    assert!(conn.is_healthy());
    assert_eq!(connector.handshakes().len(), 3);
    assert_eq!(pool.metrics().key(&key).unwrap().failed, 2);
}

#[tokio::test]
async fn authentication_failures_are_not_retried() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.reject_status = Some(401);
    let connector = MemoryConnector::new(script);
    let (pool, key) = pool_over(&connector, settings(1, 0));

    let err = pool.acquire(&key).await.unwrap_err();

    assert!(matches!(err, ClientError::Authentication(_)), "{err}");
    assert_eq!(connector.handshakes().len(), 1);
}

#[tokio::test]
async fn breaker_fails_fast_after_repeated_failures() {
    let mut factory = MockConnectionFactory::new();
    factory
        .expect_connect()
        .times(3)
        .returning(|_| Err(ClientError::connection("refused")));

    let mut settings = settings(2, 0);
    settings.retry.max_attempts = 1;
    settings.breaker = BreakerSettings {
        failure_threshold: 3,
        open_duration_ms: 60_000,
    };
    let pool = ConnectionPool::new(settings, Arc::new(factory)).unwrap();
    let key = pool.register(server()).unwrap();

    for _ in 0..3 {
        let err = pool.acquire(&key).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)), "{err}");
    }

    let err = pool.acquire(&key).await.unwrap_err();
    assert!(!err.is_retryable());
    match err {
        ClientError::CircuitOpen { key: open_key, retry_after } => {
            assert_eq!(open_key, key.to_string());
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected CircuitOpen, got {other}"),
    }

    let metrics = pool.metrics();
    assert_eq!(metrics.key(&key).unwrap().circuit, CircuitState::Open);
    assert!(!metrics.key(&key).unwrap().is_healthy());
}

#[tokio::test]
async fn breaker_stops_retries_within_one_acquire() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.fail_first = 10;
    let connector = MemoryConnector::new(script);

    let mut settings = settings(1, 0);
    settings.retry.max_attempts = 5;
    settings.breaker.failure_threshold = 2;
    let (pool, key) = pool_over(&connector, settings);

    let err = pool.acquire(&key).await.unwrap_err();

    assert!(matches!(err, ClientError::CircuitOpen { .. }), "{err}");
    assert_eq!(connector.handshakes().len(), 2);
}

// ============================================================================
// Warm-up, health checks and shutdown
// ============================================================================

#[tokio::test]
async fn warm_up_opens_min_connections() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(5, 2));

    assert_eq!(pool.warm_up(&key).await.unwrap(), 2);
    assert_eq!(pool.warm_up(&key).await.unwrap(), 0);

    let metrics = pool.metrics();
    let key_metrics = metrics.key(&key).unwrap();
    assert_eq!(key_metrics.idle, 2);
    assert_eq!(key_metrics.healthy, 2);
    assert_eq!(key_metrics.created, 2);
}

#[tokio::test]
async fn health_check_replaces_dead_idle_connections() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(5, 2));
    pool.warm_up(&key).await.unwrap();

    connector.server(0).unwrap().fail("connection reset");
    for _ in 0..100 {
        if pool.metrics().key(&key).unwrap().healthy == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pool.check_health().await;

    let metrics = pool.metrics();
    let key_metrics = metrics.key(&key).unwrap();
    assert_eq!(key_metrics.evicted, 1);
    assert_eq!(key_metrics.total, 2);
    assert_eq!(key_metrics.healthy, 2);
    assert_eq!(connector.accepted(), 3);
}

#[tokio::test]
async fn background_health_loop_runs_until_close() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let mut settings = settings(3, 1);
    settings.health_check_interval_ms = 20;
    let (pool, key) = pool_over(&connector, settings);

    pool.start_health_checks();
    for _ in 0..100 {
        if pool.metrics().key(&key).unwrap().total == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.metrics().key(&key).unwrap().total, 1);

    pool.close().await;
    assert_eq!(pool.metrics().total(), 0);
}

#[tokio::test]
async fn close_disconnects_idle_and_rejects_new_acquires() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (pool, key) = pool_over(&connector, settings(2, 1));

    let held = pool.acquire(&key).await.unwrap();
    let idle = pool.acquire(&key).await.unwrap();
    let idle_conn = Arc::clone(idle.connection());
    drop(idle);

    pool.close().await;

    assert_eq!(idle_conn.state(), ConnectionState::Disconnected);
    assert!(matches!(pool.acquire(&key).await, Err(ClientError::NotConnected)));

    let held_conn = Arc::clone(held.connection());
    drop(held);
    assert!(
        wait_for_state(&held_conn, ConnectionState::Disconnected, Duration::from_secs(1)).await
    );
    assert_eq!(pool.metrics().total(), 0);
}
