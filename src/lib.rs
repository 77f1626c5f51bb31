//! Asynchronous wire-protocol driver engine for a MongoDB-style document store.
//!
//! The crate is layered bottom-up:
//! - [`protocol`]: OP_MSG / OP_COMPRESSED framing, pure and transport independent
//! - [`connection`]: one duplex stream with a read loop and request correlation
//! - [`pool`]: bounded connection pool with FIFO waiters, eviction and drain
//! - [`cursor`]: lazy result cursors with `getMore` refills
//! - [`client`]: the command executor tying the above together

pub mod client;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod options;
pub mod pool;
pub mod protocol;

pub use client::{Client, ClientBuilder};
pub use connection::{Connection, ConnectionState, Handshake, HelloHandshake, NegotiatedFeatures};
pub use cursor::{Cursor, CursorOptions, CursorState};
pub use error::{ConnectErrorKind, DriverError, DriverResult, FrameError};
pub use options::{ClientOptions, ConnectOptions, PoolOptions, ServerAddress, TlsOptions};
pub use pool::{ConnectionPool, Connector, PoolStats, PooledConnection, TcpConnector};
pub use protocol::{FrameCodec, Message, MessageFlags, Section};
