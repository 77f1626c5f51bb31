use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{Connection, Handshake};
use crate::error::DriverResult;
use crate::options::{ConnectOptions, ServerAddress};

/// Creates the connections a pool hands out.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, id: u64) -> DriverResult<Connection>;
}

/// Dials the server over TCP (and TLS when configured).
pub struct TcpConnector {
    address: ServerAddress,
    options: ConnectOptions,
    handshake: Arc<dyn Handshake>,
}

impl TcpConnector {
    pub fn new(address: ServerAddress, options: ConnectOptions, handshake: Arc<dyn Handshake>) -> Self {
        Self {
            address,
            options,
            handshake,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, id: u64) -> DriverResult<Connection> {
        Connection::open(id, &self.address, &self.options, self.handshake.as_ref()).await
    }
}
