use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use spacelink_domain::{
    ConnectionState, Credentials, Player, PlayerStatus, SerializationFormat, ServerConfig,
    ServerLanguage, WireProtocol,
};
use spacelink_shared::{
    ClientMessage, DatabaseUpdate, InitialSubscription, Serializer, ServerMessage,
    SubscriptionError, WirePayload,
};

use super::*;
use crate::credentials::{MemoryCredentialStore, MockCredentialStore};
use crate::events::{ClientEvent, EventKind, EventPayload};
use crate::testing::{MemoryConnector, SentFrame, ServerScript, SubscriptionReply};
use crate::transport::Incoming;

fn config(language: ServerLanguage, protocol: WireProtocol) -> ServerConfig {
    ServerConfig::new(language, "localhost", 3000, "arena").with_protocol(protocol)
}

fn connect_to(
    connector: &MemoryConnector,
    config: ServerConfig,
    options: ConnectionOptions,
) -> (Connection, Arc<MemoryCredentialStore>) {
    let store = Arc::new(MemoryCredentialStore::new());
    let connection = Connection::new(
        config,
        Arc::new(connector.clone()),
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        options,
    );
    (connection, store)
}

fn record_events(dispatcher: &EventDispatcher) -> (Arc<Mutex<Vec<ClientEvent>>>, crate::events::SubscriptionHandle) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = dispatcher.subscribe_fn("test", &EventKind::ALL, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    (seen, handle)
}

async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn player_row_ts() -> serde_json::Value {
    json!({
        "identity": "c200",
        "playerId": 1,
        "name": "zed",
        "status": "active",
        "createdAt": 1_700_000_000_000u64
    })
}

// ============================================================================
// Frame type discipline
// ============================================================================

#[tokio::test]
async fn json_connection_never_uses_the_binary_path() {
    let connector = MemoryConnector::new(
        ServerScript::new(WireProtocol::Json).with_rows("players", vec![player_row_ts()]),
    );
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::TypeScript, WireProtocol::Json),
        ConnectionOptions::default(),
    );

    connection.connect().await.unwrap();
    connection.subscribe(["players"]).await.unwrap();
    connection.call_reducer("enter_game", &json!(["zed"])).await.unwrap();
    connection.one_off_query("SELECT * FROM players").await.unwrap();
    connection.disconnect().await;

    let frames = connector.frames(0);
    let data: Vec<_> = frames.iter().filter(|f| f.is_data()).collect();
    assert_eq!(data.len(), 3);
    assert!(data.iter().all(|f| matches!(f, SentFrame::Text(_))));
    assert_eq!(frames.last(), Some(&SentFrame::Close(1000)));
}

#[tokio::test]
async fn binary_connection_never_uses_the_text_path() {
    let connector = MemoryConnector::new(
        ServerScript::new(WireProtocol::Binary).with_rows("players", vec![player_row_ts()]),
    );
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::TypeScript, WireProtocol::Binary),
        ConnectionOptions::default(),
    );

    connection.connect().await.unwrap();
    connection.subscribe(["players"]).await.unwrap();
    connection.call_reducer("enter_game", &json!(["zed"])).await.unwrap();
    let tables = connection.one_off_query("SELECT * FROM players").await.unwrap();
    connection.disconnect().await;

    assert_eq!(tables[0].rows[0]["player_id"], 1);
    let data: Vec<_> = connector.frames(0).into_iter().filter(|f| f.is_data()).collect();
    assert_eq!(data.len(), 3);
    assert!(data.iter().all(|f| matches!(f, SentFrame::Binary(_))));
}

#[tokio::test]
async fn wrong_frame_type_is_refused_before_the_socket() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    let err = connection
        .send_message(WirePayload::Binary(vec![0, 1, 2]))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::ProtocolViolation(_)));
    assert!(connector.frames(0).is_empty());
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn frames_of_the_wrong_type_from_the_server_are_dropped() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    let server = connector.server(0).unwrap();
    server.send_raw(Incoming::Binary(vec![1, 2, 3]));
    server.send_raw(Incoming::Text(r#"{"Heartbeat":{}}"#.into()));

    connection.subscribe(["players"]).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Subscribed);
}

#[tokio::test]
async fn mismatched_negotiation_closes_with_protocol_error() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.negotiated_override = Some(WireProtocol::BINARY_SUBPROTOCOL.to_string());
    let connector = MemoryConnector::new(script);
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );

    let err = connection.connect().await.unwrap_err();

    assert!(matches!(err, ClientError::ProtocolViolation(_)));
    assert_eq!(connector.frames(0), vec![SentFrame::Close(1002)]);
    assert_eq!(connector.open_sockets(), 0);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn auth_challenge_is_cached_and_reused() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.challenge = Some(Credentials::new("c200", "token-1"));
    let connector = MemoryConnector::new(script);
    let (connection, store) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );

    connection.connect().await.unwrap();
    connection.disconnect().await;
    connection.connect().await.unwrap();

    assert_eq!(connector.challenges(), 1);
    let bearers: Vec<_> = connector
        .handshakes()
        .into_iter()
        .map(|h| h.bearer)
        .collect();
    assert_eq!(
        bearers,
        vec![None, Some("token-1".to_string()), Some("token-1".to_string())]
    );
    let stored = store.load("localhost:arena").await.unwrap().unwrap();
    assert_eq!(stored.identity, "c200");
}

#[tokio::test]
async fn cached_credentials_skip_the_challenge() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.challenge = Some(Credentials::new("c200", "token-1"));
    let connector = MemoryConnector::new(script);

    let mut store = MockCredentialStore::new();
    store
        .expect_load()
        .returning(|_| Ok(Some(Credentials::new("c200", "token-1"))));
    store.expect_store().never();

    let connection = Connection::new(
        config(ServerLanguage::Rust, WireProtocol::Json),
        Arc::new(connector.clone()),
        Arc::new(store),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    assert_eq!(connector.challenges(), 0);
    assert_eq!(connector.handshakes().len(), 1);
}

#[tokio::test]
async fn rejected_upgrade_is_an_authentication_error() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.reject_status = Some(403);
    let connector = MemoryConnector::new(script);
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );

    let err = connection.connect().await.unwrap_err();

    assert!(matches!(err, ClientError::Authentication(_)));
    assert!(!err.is_retryable());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn identity_token_refreshes_stored_credentials() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.send_identity = Some(Credentials::new("c300", "fresh"));
    let connector = MemoryConnector::new(script);
    let (connection, store) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    for _ in 0..200 {
        if store.load("localhost:arena").await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stored = store.load("localhost:arena").await.unwrap().unwrap();
    assert_eq!(stored.auth_token, "fresh");
    assert_eq!(connection.identity().await.as_deref(), Some("c300"));
}

#[tokio::test]
async fn connect_timeout_leaves_no_socket() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.connect_latency = Duration::from_millis(300);
    let connector = MemoryConnector::new(script);
    let options = ConnectionOptions {
        settings: ConnectionSettings {
            connect_timeout_ms: 50,
            ..ConnectionSettings::default()
        },
        ..ConnectionOptions::default()
    };
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        options,
    );

    let err = connection.connect().await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connector.open_sockets(), 0);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn subscribing_twice_keeps_one_entry() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    connection.subscribe(["players"]).await.unwrap();
    connection.subscribe(["players", "players"]).await.unwrap();

    let subscriptions = connection.subscriptions().await;
    assert_eq!(subscriptions.tables(), vec!["players".to_string()]);
    let data: Vec<_> = connector.frames(0).into_iter().filter(|f| f.is_data()).collect();
    assert_eq!(data.len(), 1);
}

#[tokio::test]
async fn subscribe_sends_the_full_set_without_a_type_field() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    connection.subscribe(["players"]).await.unwrap();
    connection.subscribe(["food"]).await.unwrap();

    let SentFrame::Text(last) = connector.frames(0).last().cloned().unwrap() else {
        panic!("expected a text frame");
    };
    let value: serde_json::Value = serde_json::from_str(&last).unwrap();
    assert!(value.get("type").is_none());
    let queries = value["Subscribe"]["query_strings"].as_array().unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(connection.subscriptions().await.len(), 2);
}

#[tokio::test]
async fn rejected_subscription_leaves_the_set_unchanged() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.subscription_reply = SubscriptionReply::Reject("no such table".into());
    let connector = MemoryConnector::new(script);
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    let err = connection.subscribe(["ghosts"]).await.unwrap_err();

    assert!(matches!(err, ClientError::Rejected { operation: "subscribe", .. }));
    assert!(connection.subscriptions().await.is_empty());
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn unanswered_subscription_times_out() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.subscription_reply = SubscriptionReply::Silent;
    let connector = MemoryConnector::new(script);
    let options = ConnectionOptions {
        settings: ConnectionSettings {
            subscribe_timeout_ms: 50,
            ..ConnectionSettings::default()
        },
        ..ConnectionOptions::default()
    };
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        options,
    );
    connection.connect().await.unwrap();

    let err = connection.subscribe(["players"]).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(connection.subscriptions().await.is_empty());
}

#[tokio::test]
async fn late_reply_to_a_timed_out_subscribe_is_not_credited_to_the_next() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.subscription_reply = SubscriptionReply::Silent;
    let connector = MemoryConnector::new(script);
    let options = ConnectionOptions {
        settings: ConnectionSettings {
            subscribe_timeout_ms: 300,
            ..ConnectionSettings::default()
        },
        ..ConnectionOptions::default()
    };
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        options,
    );
    let connection = Arc::new(connection);
    connection.connect().await.unwrap();

    assert!(connection.subscribe(["players"]).await.unwrap_err().is_timeout());

    let second = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.subscribe(["food"]).await })
    };
    until(|| connector.frames(0).iter().filter(|f| f.is_data()).count() == 2).await;

    let server = connector.server(0).unwrap();
    server.send(&ServerMessage::InitialSubscription(InitialSubscription {
        database_update: DatabaseUpdate::default(),
        request_id: 1,
        total_host_execution_duration_micros: 0,
    }));
    server.send(&ServerMessage::SubscriptionError(SubscriptionError {
        request_id: Some(2),
        table_id: None,
        error: "no such table".into(),
    }));

    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Rejected { operation: "subscribe", .. }));
    assert!(connection.subscriptions().await.is_empty());
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn snapshot_rows_arrive_as_canonical_insert_events() {
    let dispatcher = EventDispatcher::new();
    let (seen, _handle) = record_events(&dispatcher);
    let connector = MemoryConnector::new(
        ServerScript::new(WireProtocol::Json).with_rows("players", vec![player_row_ts()]),
    );
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::TypeScript, WireProtocol::Json),
        ConnectionOptions {
            events: Some(dispatcher.clone()),
            ..ConnectionOptions::default()
        },
    );

    connection.connect().await.unwrap();
    connection.subscribe(["players"]).await.unwrap();
    dispatcher.flush().await;

    let events = seen.lock().unwrap().clone();
    let player = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::TableInsert(row) => Some(row.decode::<Player>().unwrap()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        player,
        Player {
            identity: "c200".into(),
            player_id: 1,
            name: "zed".into(),
            status: PlayerStatus::Active,
        }
    );
    assert!(events.iter().all(|e| e.source == connection.id()));
}

// ============================================================================
// Reducers
// ============================================================================

#[tokio::test]
async fn reducer_args_follow_the_server_convention() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::TypeScript, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    connection.connect().await.unwrap();

    let outcome = connection
        .call_reducer_confirmed("enter_game", &json!({ "player_name": "zed" }))
        .await
        .unwrap();
    assert_eq!(outcome, ReducerOutcome::Committed);

    let SentFrame::Text(text) = connector.frames(0)[0].clone() else {
        panic!("expected a text frame");
    };
    let message = Serializer::new(SerializationFormat::Json)
        .decode_client(&WirePayload::Text(text))
        .unwrap();
    let ClientMessage::CallReducer(call) = message else {
        panic!("expected CallReducer");
    };
    assert_eq!(call.reducer, "enter_game");
    assert_eq!(call.args, json!({ "playerName": "zed" }));
}

#[tokio::test]
async fn calls_before_connect_are_refused() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );

    let err = connection.call_reducer("noop", &()).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
    assert!(matches!(
        connection.subscribe(["players"]).await,
        Err(ClientError::NotConnected)
    ));
}

// ============================================================================
// Close and loss
// ============================================================================

#[tokio::test]
async fn close_mid_subscription_sends_only_the_close_frame() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.subscription_reply = SubscriptionReply::Silent;
    let connector = MemoryConnector::new(script);
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions::default(),
    );
    let connection = Arc::new(connection);
    connection.connect().await.unwrap();

    let subscriber = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.subscribe(["players"]).await })
    };
    until(|| connector.frames(0).len() == 1).await;

    connection.disconnect().await;

    let frames = connector.frames(0);
    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0], SentFrame::Text(_)));
    assert_eq!(frames[1], SentFrame::Close(1000));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(subscriber.await.unwrap().is_err());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_bounded() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.ack_close = false;
    let connector = MemoryConnector::new(script);
    let options = ConnectionOptions {
        settings: ConnectionSettings {
            close_timeout_ms: 50,
            ..ConnectionSettings::default()
        },
        ..ConnectionOptions::default()
    };
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        options,
    );

    connection.disconnect().await;
    connection.connect().await.unwrap();
    connection.disconnect().await;
    connection.disconnect().await;

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connector.frames(0), vec![SentFrame::Close(1000)]);
    assert_eq!(connector.open_sockets(), 0);
}

#[tokio::test]
async fn socket_failure_surfaces_connection_lost() {
    let dispatcher = EventDispatcher::new();
    let (seen, _handle) = record_events(&dispatcher);
    let mut script = ServerScript::new(WireProtocol::Json);
    script.ack_reducers = false;
    let connector = MemoryConnector::new(script);
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        ConnectionOptions {
            events: Some(dispatcher.clone()),
            ..ConnectionOptions::default()
        },
    );
    let connection = Arc::new(connection);
    connection.connect().await.unwrap();

    let waiter = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.call_reducer_confirmed("noop", &()).await })
    };
    until(|| connector.frames(0).len() == 1).await;
    connector.server(0).unwrap().fail("connection reset");

    assert!(wait_for_state(&connection, ConnectionState::Disconnected, Duration::from_secs(1)).await);
    assert!(matches!(waiter.await.unwrap(), Err(ClientError::ConnectionLost(_))));
    assert!(!connection.is_healthy());

    dispatcher.flush().await;
    let states: Vec<ConnectionState> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ConnectionLifecycle { current, .. } => Some(*current),
            _ => None,
        })
        .collect();
    assert!(states.contains(&ConnectionState::Error));
    assert_eq!(states.last(), Some(&ConnectionState::Disconnected));

    // The owner decides to reconnect
    connection.connect().await.unwrap();
    assert_eq!(connector.accepted(), 2);
}

#[tokio::test]
async fn silent_server_fails_the_heartbeat() {
    let mut script = ServerScript::new(WireProtocol::Json);
    script.answer_pings = false;
    let connector = MemoryConnector::new(script);
    let options = ConnectionOptions {
        settings: ConnectionSettings {
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 60,
            ..ConnectionSettings::default()
        },
        ..ConnectionOptions::default()
    };
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        options,
    );
    connection.connect().await.unwrap();

    assert!(wait_for_state(&connection, ConnectionState::Disconnected, Duration::from_secs(2)).await);
    let frames = connector.frames(0);
    assert!(frames.contains(&SentFrame::Ping));
    assert!(frames.iter().all(|f| !f.is_data()));
}

#[tokio::test]
async fn answered_pings_keep_the_connection_healthy() {
    let connector = MemoryConnector::new(ServerScript::new(WireProtocol::Json));
    let options = ConnectionOptions {
        settings: ConnectionSettings {
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 60,
            ..ConnectionSettings::default()
        },
        ..ConnectionOptions::default()
    };
    let (connection, _) = connect_to(
        &connector,
        config(ServerLanguage::Rust, WireProtocol::Json),
        options,
    );
    connection.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(connection.is_healthy());
    assert!(connector.frames(0).contains(&SentFrame::Ping));
}
