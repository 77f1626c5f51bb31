//! Client Tests
//!
//! Tests for the command executor, including:
//! - Command replies and typed command errors
//! - Running on a caller-held connection
//! - Configuration from TOML and the builder
//! - Shutdown with close_all

mod common;

use std::io::Write;
use std::time::Duration;

use bson::doc;
use common::{command_name, MockServer, Reply};
use docwire::{Client, ClientOptions, ConnectErrorKind, DriverError};

#[tokio::test]
async fn test_execute_adds_database() {
    let server = MockServer::start(|body| {
        Reply::Now(doc! { "ok": 1, "n": 3, "db": body.get_str("$db").unwrap_or_default() })
    })
    .await;
    let client = Client::builder(&server.uri()).build().await.unwrap();

    let reply = client
        .execute("shop", doc! { "count": "orders" }, None)
        .await
        .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 3);
    assert_eq!(reply.get_str("db").unwrap(), "shop");

    let counts = server.received_named("count");
    assert_eq!(counts.len(), 1);
    assert_eq!(command_name(&counts[0]), "count");
}

#[tokio::test]
async fn test_command_error_is_typed() {
    let server = MockServer::start(|body| match command_name(body) {
        "drop" => Reply::Now(doc! {
            "ok": 0.0,
            "errmsg": "ns not found",
            "code": 26,
            "codeName": "NamespaceNotFound",
        }),
        _ => Reply::Now(doc! { "ok": 1.0 }),
    })
    .await;
    let client = Client::builder(&server.uri()).build().await.unwrap();

    let err = client
        .execute("shop", doc! { "drop": "missing" }, None)
        .await
        .unwrap_err();
    match err {
        DriverError::Command {
            code,
            code_name,
            message,
        } => {
            assert_eq!(code, 26);
            assert_eq!(code_name, "NamespaceNotFound");
            assert_eq!(message, "ns not found");
        }
        other => panic!("Expected command error, got {other:?}"),
    }

    // A command error leaves the connection healthy and pooled.
    let stats = client.pool().stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.idle, 1);
    client.ping().await.unwrap();
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_execute_on_given_connection() {
    let server = MockServer::ok().await;
    let client = Client::builder(&server.uri())
        .max_pool_size(1)
        .checkout_timeout(Some(Duration::from_millis(50)))
        .build()
        .await
        .unwrap();

    let pinned = client.pool().checkout().await.unwrap();
    // The only slot is taken, so this must run on `pinned`.
    client
        .execute("admin", doc! { "ping": 1 }, Some(&*pinned))
        .await
        .unwrap();
    assert!(matches!(
        client.execute("admin", doc! { "ping": 1 }, None).await,
        Err(DriverError::PoolExhausted { .. })
    ));
}

#[tokio::test]
async fn test_request_timeout() {
    let server = MockServer::start(|body| match command_name(body) {
        "sleep" => Reply::After(Duration::from_millis(300), doc! { "ok": 1.0 }),
        _ => Reply::Now(doc! { "ok": 1.0 }),
    })
    .await;
    let client = Client::builder(&server.uri())
        .request_timeout(Some(Duration::from_millis(30)))
        .build()
        .await
        .unwrap();

    let err = client
        .execute("admin", doc! { "sleep": 1 }, None)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::builder(&format!("127.0.0.1:{port}")).build().await.unwrap();
    let err = client.ping().await.unwrap_err();
    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));

    let err = Client::builder(&format!("127.0.0.1:{port}"))
        .min_pool_size(1)
        .build()
        .await
        .err()
        .unwrap();
    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
}

#[tokio::test]
async fn test_connect_from_config_file() {
    let server = MockServer::ok().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        address = "{}"
        app_name = "config-test"
        request_timeout_ms = 2000

        [pool]
        max_pool_size = 2
        min_pool_size = 1
        "#,
        server.uri()
    )
    .unwrap();

    let options = ClientOptions::from_file(file.path()).unwrap();
    let client = Client::connect(options).await.unwrap();
    assert_eq!(client.pool().stats().live, 1);

    let hello = server.received_named("hello");
    assert_eq!(hello.len(), 1);
    let app = hello[0]
        .get_document("client")
        .unwrap()
        .get_document("application")
        .unwrap();
    assert_eq!(app.get_str("name").unwrap(), "config-test");
}

#[tokio::test]
async fn test_close_all() {
    let server = MockServer::ok().await;
    let client = Client::builder(&server.uri())
        .min_pool_size(2)
        .build()
        .await
        .unwrap();
    assert_eq!(client.pool().stats().idle, 2);

    client.close_all().await;
    assert_eq!(client.pool().stats().live, 0);
    assert!(matches!(client.ping().await, Err(DriverError::PoolClosed)));
}
