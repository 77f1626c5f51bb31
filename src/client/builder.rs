use std::sync::Arc;
use std::time::Duration;

use super::Client;
use crate::connection::Handshake;
use crate::error::DriverResult;
use crate::options::{ClientOptions, TlsOptions};
use crate::pool::Connector;

/// Builder for creating a [`Client`] with additional options
pub struct ClientBuilder {
    options: ClientOptions,
    handshake: Option<Arc<dyn Handshake>>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    /// Create a new builder for `address` with default options
    pub fn new(address: &str) -> Self {
        Self::from_options(ClientOptions::new(address))
    }

    /// Start from already loaded options, e.g. from a config file
    pub fn from_options(options: ClientOptions) -> Self {
        Self {
            options,
            handshake: None,
            connector: None,
        }
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.options.pool.max_pool_size = size;
        self
    }

    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.options.pool.min_pool_size = size;
        self
    }

    /// How long a checkout may wait for a free connection; `None` waits forever
    pub fn checkout_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.pool.checkout_timeout = timeout;
        self
    }

    pub fn max_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.options.pool.max_idle_time = idle;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect.connect_timeout = timeout;
        self
    }

    /// Deadline for each command round trip
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn app_name(mut self, name: &str) -> Self {
        self.options.app_name = Some(name.to_string());
        self
    }

    /// Compressors to offer the server, in preference order
    pub fn compressors(mut self, names: &[&str]) -> Self {
        self.options.connect.compressors = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.options.connect.tls = Some(tls);
        self
    }

    /// Replace the default `hello` handshake, e.g. to add authentication
    pub fn handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Open connections through a custom connector instead of TCP
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Build the client
    pub async fn build(self) -> DriverResult<Client> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => Client::tcp_connector(&self.options, self.handshake)?,
        };
        Client::with_connector(self.options, connector).await
    }
}
