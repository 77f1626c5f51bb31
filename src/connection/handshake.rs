//! Connection handshake: the first exchange on every new connection.

use async_trait::async_trait;
use bson::{doc, Bson, Document};

use super::Connection;
use crate::error::DriverResult;
use crate::protocol::reply::{as_i64, check_ok};

/// What the server reported about itself in the handshake reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiatedFeatures {
    pub max_wire_version: i32,
    pub min_wire_version: i32,
    pub max_bson_object_size: Option<i64>,
    pub max_message_size_bytes: Option<i64>,
    pub max_write_batch_size: Option<i64>,
    /// Compressors the server accepts, in its preference order.
    pub compression: Vec<String>,
    /// The server's id for this connection.
    pub connection_id: Option<i64>,
    pub is_writable_primary: bool,
    pub read_only: bool,
    pub logical_session_timeout_minutes: Option<i64>,
    pub sasl_supported_mechs: Vec<String>,
}

impl NegotiatedFeatures {
    pub fn from_hello(reply: &Document) -> Self {
        let int = |key: &str| reply.get(key).and_then(as_i64);
        let strings = |key: &str| -> Vec<String> {
            reply
                .get_array(key)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let flag = |key: &str| reply.get_bool(key).unwrap_or(false);

        Self {
            max_wire_version: int("maxWireVersion").unwrap_or(0) as i32,
            min_wire_version: int("minWireVersion").unwrap_or(0) as i32,
            max_bson_object_size: int("maxBsonObjectSize"),
            max_message_size_bytes: int("maxMessageSizeBytes"),
            max_write_batch_size: int("maxWriteBatchSize"),
            compression: strings("compression"),
            connection_id: int("connectionId"),
            is_writable_primary: flag("isWritablePrimary") || flag("ismaster"),
            read_only: flag("readOnly"),
            logical_session_timeout_minutes: int("logicalSessionTimeoutMinutes"),
            sasl_supported_mechs: strings("saslSupportedMechs"),
        }
    }
}

/// Runs on a freshly opened connection before it is handed out.
///
/// Implementations may authenticate as well; any error rejects the connection.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn negotiate(&self, connection: &Connection) -> DriverResult<NegotiatedFeatures>;
}

/// The standard `hello` exchange.
#[derive(Debug, Clone)]
pub struct HelloHandshake {
    pub app_name: Option<String>,
    /// Compressor names to offer, in preference order.
    pub compressors: Vec<String>,
    pub database: String,
}

impl Default for HelloHandshake {
    fn default() -> Self {
        Self {
            app_name: None,
            compressors: Vec::new(),
            database: "admin".to_string(),
        }
    }
}

impl HelloHandshake {
    pub fn new(app_name: Option<String>, compressors: Vec<String>) -> Self {
        Self {
            app_name,
            compressors,
            ..Self::default()
        }
    }

    pub fn command(&self) -> Document {
        let mut client = doc! {
            "driver": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };
        if let Some(name) = &self.app_name {
            client.insert("application", doc! { "name": name.as_str() });
        }

        let compression: Vec<Bson> = self
            .compressors
            .iter()
            .map(|name| Bson::String(name.clone()))
            .collect();

        doc! {
            "hello": 1,
            "$db": self.database.as_str(),
            "client": client,
            "compression": compression,
        }
    }
}

#[async_trait]
impl Handshake for HelloHandshake {
    async fn negotiate(&self, connection: &Connection) -> DriverResult<NegotiatedFeatures> {
        let reply = connection.command(self.command(), None).await?;
        check_ok(&reply)?;

        let features = NegotiatedFeatures::from_hello(&reply);
        tracing::debug!(
            connection_id = connection.id(),
            address = %connection.address(),
            "[HANDSHAKE] Server wire versions {}..{}, compression {:?}",
            features.min_wire_version,
            features.max_wire_version,
            features.compression
        );
        Ok(features)
    }
}

/// Skips the exchange entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn negotiate(&self, _connection: &Connection) -> DriverResult<NegotiatedFeatures> {
        Ok(NegotiatedFeatures::default())
    }
}
