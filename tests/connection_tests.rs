//! Connection Tests
//!
//! Tests for single connections against the mock server, including:
//! - Opening, refused addresses and the hello handshake
//! - Lost-connection drain of pending requests
//! - Request timeouts and unacknowledged writes

mod common;

use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use common::{command_name, MockServer, Reply};
use docwire::connection::NoHandshake;
use docwire::protocol::reply::check_ok;
use docwire::{
    ConnectErrorKind, ConnectOptions, Connection, ConnectionState, DriverError, HelloHandshake,
    Message, ServerAddress,
};

async fn open(server: &MockServer) -> Connection {
    Connection::open(1, &server.address(), &ConnectOptions::default(), &NoHandshake)
        .await
        .unwrap()
}

// ============================================================================
// Opening
// ============================================================================

#[tokio::test]
async fn test_open_refused() {
    let address = ServerAddress::parse("db://localhost:1").unwrap();
    let err = Connection::open(1, &address, &ConnectOptions::default(), &NoHandshake)
        .await
        .unwrap_err();

    match &err {
        DriverError::Connect { address, kind, .. } => {
            assert_eq!(*kind, ConnectErrorKind::Refused);
            assert_eq!(address, "localhost:1");
        }
        other => panic!("Expected connect error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_open_with_hello_handshake() {
    let server = MockServer::ok().await;
    let handshake = HelloHandshake::new(Some("tests".to_string()), Vec::new());

    let connection = Connection::open(5, &server.address(), &ConnectOptions::default(), &handshake)
        .await
        .unwrap();

    assert_eq!(connection.id(), 5);
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.features().max_wire_version, 21);
    assert!(connection.features().is_writable_primary);

    let hello = server.received_named("hello");
    assert_eq!(hello.len(), 1);
    assert_eq!(hello[0].get_str("$db").unwrap(), "admin");
}

#[tokio::test]
async fn test_handshake_timeout() {
    struct Stalled;

    #[async_trait::async_trait]
    impl docwire::Handshake for Stalled {
        async fn negotiate(
            &self,
            connection: &Connection,
        ) -> docwire::DriverResult<docwire::NegotiatedFeatures> {
            connection.command(doc! { "stall": 1 }, None).await?;
            Ok(Default::default())
        }
    }

    let server = MockServer::start(|_| Reply::Silent).await;
    let options = ConnectOptions {
        handshake_timeout: Duration::from_millis(50),
        ..ConnectOptions::default()
    };

    let err = Connection::open(1, &server.address(), &options, &Stalled)
        .await
        .unwrap_err();
    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Timeout));
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_command_round_trip() {
    let server = MockServer::start(|body| {
        Reply::Now(doc! { "ok": 1.0, "name": command_name(body) })
    })
    .await;
    let connection = open(&server).await;

    let reply = connection
        .command(doc! { "count": "orders", "$db": "shop" }, None)
        .await
        .unwrap();
    check_ok(&reply).unwrap();
    assert_eq!(reply.get_str("name").unwrap(), "count");
}

#[tokio::test]
async fn test_timeout_leaves_connection_ready() {
    let server = MockServer::start(|body| match command_name(body) {
        "slow" => Reply::After(Duration::from_millis(200), doc! { "ok": 1.0 }),
        _ => Reply::Now(doc! { "ok": 1.0, "fast": true }),
    })
    .await;
    let connection = open(&server).await;

    let err = connection
        .command(doc! { "slow": 1 }, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Timeout { .. }));
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.pending_requests(), 0);

    let reply = connection.command(doc! { "fast": 1 }, None).await.unwrap();
    assert!(reply.get_bool("fast").unwrap());

    // The late reply arrives with nobody waiting for it.
    common::wait_until(|| connection.unmatched_replies() == 1).await;
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_unacknowledged_write() {
    let server = MockServer::ok().await;
    let connection = open(&server).await;

    connection
        .send_unacknowledged(Message::command(doc! { "insert": "logs", "$db": "app" }))
        .await
        .unwrap();
    common::wait_until(|| server.received_named("insert").len() == 1).await;

    // The connection is still in sync for acknowledged requests.
    connection.command(doc! { "ping": 1 }, None).await.unwrap();
}

// ============================================================================
// Connection loss
// ============================================================================

#[tokio::test]
async fn test_lost_connection_fails_all_pending() {
    let server = MockServer::start(|body| match command_name(body) {
        "die" => Reply::Close,
        _ => Reply::Silent,
    })
    .await;
    let connection = Arc::new(open(&server).await);

    let mut pending = Vec::new();
    for i in 0..8 {
        pending.push(
            connection
                .send_request(Message::command(doc! { "wait": i }))
                .await
                .unwrap(),
        );
    }
    common::wait_until(|| server.received_named("wait").len() == 8).await;
    assert_eq!(connection.pending_requests(), 8);

    connection
        .send_unacknowledged(Message::command(doc! { "noop": 1 }))
        .await
        .unwrap();
    let die = connection
        .send_request(Message::command(doc! { "die": 1 }))
        .await
        .unwrap();
    pending.push(die);

    for request in pending {
        let err = request
            .wait(Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost(), "got {err:?}");
    }
    assert!(connection.is_closed());
    assert_eq!(connection.pending_requests(), 0);

    let err = connection.command(doc! { "ping": 1 }, None).await.unwrap_err();
    assert!(err.is_connection_lost());
}

#[tokio::test]
async fn test_close_fails_pending() {
    let server = MockServer::start(|_| Reply::Silent).await;
    let connection = open(&server).await;

    let request = connection
        .send_request(Message::command(doc! { "wait": 1 }))
        .await
        .unwrap();
    connection.close();
    connection.close();

    let err = request.wait(None).await.unwrap_err();
    assert!(err.is_connection_lost());
    assert_eq!(connection.state(), ConnectionState::Closed);
}
