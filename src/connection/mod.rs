//! A single server connection.
//!
//! Writes go through an async FIFO mutex so frames hit the wire in call order.
//! A dedicated read loop owns the read half, decodes every incoming frame and
//! hands it to the [`Correlator`], which wakes the request waiting for it. Any
//! read error, decode error or peer close moves the connection to
//! [`ConnectionState::Closed`] and fails every waiter with `ConnectionLost`.

pub mod correlator;
pub mod handshake;
pub mod transport;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{ConnectErrorKind, DriverError, DriverResult};
use crate::options::{ConnectOptions, ServerAddress};
use crate::protocol::{FrameCodec, Message, MessageFlags};

pub use correlator::{Correlator, PendingRequest};
pub use handshake::{Handshake, HelloHandshake, NegotiatedFeatures, NoHandshake};
pub use transport::{BoxedStream, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Ready = 1,
    /// Finishing in-flight work; closed when returned to the pool.
    Draining = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// State shared between the connection handle and its read loop.
struct Shared {
    id: u64,
    address: ServerAddress,
    state: AtomicU8,
    correlator: Arc<Correlator>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns false if the state was something else.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_closed(&self, reason: &str) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous != ConnectionState::Closed as u8 {
            tracing::debug!(
                connection_id = self.id,
                address = %self.address,
                "[CONN] Connection closed: {}",
                reason
            );
        }
        self.correlator.fail_all(reason);
    }

    fn lost(&self, reason: impl Into<String>) -> DriverError {
        DriverError::ConnectionLost {
            connection_id: self.id,
            reason: reason.into(),
        }
    }
}

struct Writer {
    half: WriteHalf<BoxedStream>,
    codec: FrameCodec,
}

/// Closes the connection if a write is abandoned part-way through a frame.
struct CloseOnDrop<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.mark_closed("write cancelled mid-frame");
        }
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Writer>,
    reader_task: JoinHandle<()>,
    features: parking_lot::RwLock<Arc<NegotiatedFeatures>>,
    created_at: Instant,
    last_used: parking_lot::Mutex<Instant>,
}

impl Connection {
    /// Dial `address`, run the handshake and return a ready connection.
    pub async fn open(
        id: u64,
        address: &ServerAddress,
        options: &ConnectOptions,
        handshake: &dyn Handshake,
    ) -> DriverResult<Self> {
        let stream = transport::dial(address, options).await?;
        Self::establish(id, address.clone(), stream, options, handshake).await
    }

    /// Run a connection over an already open stream.
    pub async fn establish(
        id: u64,
        address: ServerAddress,
        stream: BoxedStream,
        options: &ConnectOptions,
        handshake: &dyn Handshake,
    ) -> DriverResult<Self> {
        let codec = FrameCodec::new(options.registry.clone())
            .with_max_message_size(options.max_message_size)
            .with_checksum(options.checksum);
        let (read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            id,
            address,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            correlator: Arc::new(Correlator::new(id)),
        });
        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), read_half, codec.clone()));

        let now = Instant::now();
        let connection = Self {
            shared,
            writer: tokio::sync::Mutex::new(Writer {
                half: write_half,
                codec,
            }),
            reader_task,
            features: parking_lot::RwLock::new(Arc::new(NegotiatedFeatures::default())),
            created_at: now,
            last_used: parking_lot::Mutex::new(now),
        };

        let negotiated =
            tokio::time::timeout(options.handshake_timeout, handshake.negotiate(&connection)).await;
        let features = match negotiated {
            Ok(Ok(features)) => features,
            Ok(Err(e)) => {
                connection.close();
                return Err(handshake_error(connection.address(), e));
            }
            Err(_) => {
                connection.close();
                return Err(DriverError::connect(
                    connection.address(),
                    ConnectErrorKind::Timeout,
                    format!("handshake did not finish within {:?}", options.handshake_timeout),
                ));
            }
        };

        connection.apply_features(features, options).await;
        if !connection
            .shared
            .transition(ConnectionState::Connecting, ConnectionState::Ready)
        {
            return Err(DriverError::connect(
                connection.address(),
                ConnectErrorKind::Io,
                "connection closed during handshake",
            ));
        }

        tracing::debug!(
            connection_id = id,
            address = %connection.address(),
            "[CONN] Connection ready"
        );
        Ok(connection)
    }

    async fn apply_features(&self, features: NegotiatedFeatures, options: &ConnectOptions) {
        let agreed: Vec<String> = features
            .compression
            .iter()
            .filter(|name| options.compressors.contains(*name))
            .cloned()
            .collect();
        let compressor = options.registry.pick(&agreed);
        let max_message_size = features
            .max_message_size_bytes
            .and_then(|size| usize::try_from(size).ok())
            .map_or(options.max_message_size, |size| {
                size.min(options.max_message_size)
            });

        if let Some(compressor) = &compressor {
            tracing::debug!(
                connection_id = self.id(),
                "[CONN] Compressing with {}",
                compressor.name()
            );
        }

        {
            let mut writer = self.writer.lock().await;
            let codec = writer
                .codec
                .clone()
                .with_compressor(compressor)
                .with_max_message_size(max_message_size);
            writer.codec = codec;
        }
        *self.features.write() = Arc::new(features);
    }

    /// Send a request and return the handle to await its reply.
    ///
    /// `MORE_TO_COME` is cleared; use [`send_unacknowledged`](Self::send_unacknowledged)
    /// for requests that expect no reply.
    pub async fn send_request(&self, mut message: Message) -> DriverResult<PendingRequest> {
        message.flags.remove(MessageFlags::MORE_TO_COME);
        let pending = self.send(message, true).await?;
        pending.ok_or_else(|| self.shared.lost("request was not registered"))
    }

    /// Send a request with `MORE_TO_COME` set; no reply is awaited.
    pub async fn send_unacknowledged(&self, mut message: Message) -> DriverResult<()> {
        message.flags.insert(MessageFlags::MORE_TO_COME);
        self.send(message, false).await.map(|_| ())
    }

    async fn send(&self, mut message: Message, register: bool) -> DriverResult<Option<PendingRequest>> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;

        let request_id = self.shared.correlator.next_request_id();
        message.request_id = request_id;
        message.response_to = 0;

        // Encoding failures leave nothing on the wire, so the connection stays usable.
        let frame = writer.codec.encode(&message)?;
        let pending = if register {
            Some(self.shared.correlator.register(request_id)?)
        } else {
            None
        };

        let mut guard = CloseOnDrop {
            shared: &self.shared,
            armed: true,
        };
        let written = transport::send_frame(&mut writer.half, &frame).await;
        guard.armed = false;

        if let Err(e) = written {
            let reason = format!("write failed: {e}");
            self.shared.mark_closed(&reason);
            return Err(self.shared.lost(reason));
        }

        *self.last_used.lock() = Instant::now();
        tracing::debug!(
            connection_id = self.id(),
            request_id,
            "[CONN] Sent {} bytes",
            frame.len()
        );
        Ok(pending)
    }

    /// Run one command and return the reply document, sequences folded in.
    ///
    /// `timeout` bounds the whole exchange. The reply is returned as is; use
    /// [`check_ok`](crate::protocol::reply::check_ok) to interpret it.
    pub async fn command(&self, body: Document, timeout: Option<Duration>) -> DriverResult<Document> {
        let exchange = async {
            let pending = self.send_request(Message::command(body)).await?;
            let reply = pending.wait(None).await?;
            Ok(reply.into_document())
        };

        match timeout {
            None => exchange.await,
            Some(after) => tokio::time::timeout(after, exchange)
                .await
                .map_err(|_| DriverError::Timeout {
                    operation: "command",
                    after,
                })?,
        }
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            return Err(self.shared.lost("connection is closed"));
        }
        Ok(())
    }

    /// Close the connection and fail everything pending. Idempotent.
    pub fn close(&self) {
        self.shared.mark_closed("closed by client");
        self.reader_task.abort();
    }

    /// A handle that can drain or close this connection from elsewhere.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
            reader: self.reader_task.abort_handle(),
        }
    }

    /// Flag the connection to be closed once it is returned to its pool.
    pub fn mark_draining(&self) {
        self.shared
            .transition(ConnectionState::Ready, ConnectionState::Draining);
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn features(&self) -> Arc<NegotiatedFeatures> {
        self.features.read().clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    pub fn unmatched_replies(&self) -> u64 {
        self.shared.correlator.unmatched_count()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remote control over a connection owned by someone else.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    reader: AbortHandle,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn mark_draining(&self) {
        self.shared
            .transition(ConnectionState::Ready, ConnectionState::Draining);
    }

    pub fn close(&self, reason: &str) {
        self.shared.mark_closed(reason);
        self.reader.abort();
    }
}

fn handshake_error(address: &ServerAddress, err: DriverError) -> DriverError {
    let kind = match &err {
        DriverError::Connect { .. } => return err,
        DriverError::Command { .. } | DriverError::InvalidReply(_) => {
            ConnectErrorKind::HandshakeRejected
        }
        DriverError::Timeout { .. } => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Io,
    };
    DriverError::connect(address, kind, err)
}

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<BoxedStream>, codec: FrameCodec) {
    let reason = loop {
        let frame = match transport::receive_one_frame(&mut reader, codec.max_message_size()).await {
            Ok(frame) => frame,
            Err(DriverError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "peer closed the connection".to_string();
            }
            Err(DriverError::Frame(e)) => {
                tracing::error!(connection_id = shared.id, "[CONN] Corrupt frame: {}", e);
                break format!("corrupt frame: {e}");
            }
            Err(e) => break format!("read failed: {e}"),
        };

        match codec.decode(&frame) {
            Ok(message) => {
                tracing::debug!(
                    connection_id = shared.id,
                    request_id = message.request_id,
                    response_to = message.response_to,
                    "[CONN] Received {} bytes",
                    frame.len()
                );
                shared.correlator.resolve(message);
            }
            Err(e) => {
                tracing::error!(connection_id = shared.id, "[CONN] Corrupt frame: {}", e);
                break format!("corrupt frame: {e}");
            }
        }
    };

    shared.mark_closed(&reason);
}
