//! Common test utilities for driver tests
//!
//! Provides a scripted in-process server speaking the wire protocol:
//! - Answers `hello` itself, everything else through a handler closure
//! - Records every command body it receives
//! - Can delay replies, stay silent, or drop the connection

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};
use docwire::connection::transport::{receive_one_frame, send_frame};
use docwire::{FrameCodec, Message, ServerAddress};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the server does with one request.
pub enum Reply {
    /// Answer right away.
    Now(Document),
    /// Answer after a delay, without holding up later requests.
    After(Duration, Document),
    /// Never answer.
    Silent,
    /// Close the connection instead of answering.
    Close,
}

type Handler = dyn Fn(&Document) -> Reply + Send + Sync;
type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub struct MockServer {
    address: ServerAddress,
    received: Arc<Mutex<Vec<Document>>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Document) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler: Arc<Handler> = Arc::new(handler);
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = {
            let received = received.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, handler.clone(), received.clone()));
                }
            })
        };

        Self {
            address: ServerAddress::new("127.0.0.1", port),
            received,
            accepted,
            task,
        }
    }

    /// A server answering every command with `{ok: 1}`.
    pub async fn ok() -> Self {
        Self::start(|_| Reply::Now(doc! { "ok": 1.0 })).await
    }

    pub fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    pub fn uri(&self) -> String {
        format!("db://{}", self.address)
    }

    /// Bodies of every command received so far, `hello` included.
    pub fn received(&self) -> Vec<Document> {
        self.received.lock().clone()
    }

    /// Received commands whose first key is `name`.
    pub fn received_named(&self, name: &str) -> Vec<Document> {
        self.received
            .lock()
            .iter()
            .filter(|doc| command_name(doc) == name)
            .cloned()
            .collect()
    }

    /// Number of TCP connections accepted.
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, handler: Arc<Handler>, received: Arc<Mutex<Vec<Document>>>) {
    let (mut reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    let codec = FrameCodec::default();

    loop {
        let Ok(frame) = receive_one_frame(&mut reader, 1 << 24).await else {
            break;
        };
        let Ok(request) = codec.decode(&frame) else {
            break;
        };

        let request_id = request.request_id;
        let expects_response = request.expects_response();
        let body = request.into_document();
        received.lock().push(body.clone());

        let reply = if command_name(&body) == "hello" {
            Reply::Now(hello_reply())
        } else {
            handler(&body)
        };
        if !expects_response {
            continue;
        }

        match reply {
            Reply::Now(doc) => write_reply(&writer, request_id, doc).await,
            Reply::After(delay, doc) => {
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_reply(&writer, request_id, doc).await;
                });
            }
            Reply::Silent => {}
            Reply::Close => {
                let _ = writer.lock().await.shutdown().await;
                break;
            }
        }
    }
}

async fn write_reply(writer: &SharedWriter, response_to: u32, body: Document) {
    let mut reply = Message::reply(response_to, body);
    reply.request_id = response_to.wrapping_add(1_000_000);
    let frame = FrameCodec::default().encode(&reply).unwrap();
    let mut guard = writer.lock().await;
    let _ = send_frame(&mut *guard, &frame).await;
}

pub fn hello_reply() -> Document {
    doc! {
        "ok": 1.0,
        "isWritablePrimary": true,
        "maxWireVersion": 21,
        "minWireVersion": 0,
        "maxBsonObjectSize": 16_777_216,
        "maxMessageSizeBytes": 48_000_000,
        "connectionId": 1,
    }
}

pub fn command_name(doc: &Document) -> &str {
    doc.keys().next().map(String::as_str).unwrap_or("")
}

/// A cursor reply: `{cursor: {id, ns, <key>: docs}, ok: 1}`.
pub fn cursor_reply(id: i64, ns: &str, key: &str, docs: Vec<Document>) -> Document {
    let batch: Vec<Bson> = docs.into_iter().map(Bson::Document).collect();
    let mut cursor = doc! { "id": id, "ns": ns };
    cursor.insert(key, batch);
    doc! { "cursor": cursor, "ok": 1.0 }
}

/// Documents `{n: from}` .. `{n: to - 1}`.
pub fn numbered(from: i32, to: i32) -> Vec<Document> {
    (from..to).map(|n| doc! { "n": n }).collect()
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
