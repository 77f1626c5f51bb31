//! Command executor: the entry point that ties the pool, connections and cursors
//! together.
//!
//! # Example
//!
//! ```rust,no_run
//! use bson::doc;
//! use docwire::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("localhost:27017").max_pool_size(4).build().await?;
//!
//!     client.execute("shop", doc! { "insert": "orders", "documents": [{ "sku": "a1" }] }, None).await?;
//!
//!     let mut cursor = client.open_cursor("shop", doc! { "find": "orders", "batchSize": 100 }).await?;
//!     while let Some(order) = cursor.next().await? {
//!         println!("{order}");
//!     }
//!
//!     client.close_all().await;
//!     Ok(())
//! }
//! ```

mod builder;

pub use builder::ClientBuilder;

use std::sync::Arc;

use bson::{doc, Bson, Document};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::connection::{Connection, Handshake, HelloHandshake};
use crate::cursor::{Cursor, CursorOptions};
use crate::error::DriverResult;
use crate::options::ClientOptions;
use crate::pool::{ConnectionPool, Connector, TcpConnector};
use crate::protocol::reply::{as_i64, check_ok};

pub struct Client {
    pool: ConnectionPool,
    options: ClientOptions,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect with `options` over TCP, pre-warming `min_pool_size` connections.
    pub async fn connect(options: ClientOptions) -> DriverResult<Self> {
        let connector = Self::tcp_connector(&options, None)?;
        Self::with_connector(options, connector).await
    }

    pub fn builder(address: &str) -> ClientBuilder {
        ClientBuilder::new(address)
    }

    /// Build a client whose pool opens connections through `connector`.
    pub async fn with_connector(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
    ) -> DriverResult<Self> {
        options.validate()?;
        let pool = ConnectionPool::new(options.pool.clone(), connector)?;
        pool.prewarm().await?;
        let maintenance = pool.spawn_maintenance();

        tracing::debug!(address = %options.address, "[CLIENT] Client ready");
        Ok(Self {
            pool,
            options,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    pub(crate) fn tcp_connector(
        options: &ClientOptions,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> DriverResult<Arc<dyn Connector>> {
        let address = options.server_address()?;
        let registry = &options.connect.registry;

        let mut offered = Vec::new();
        for name in &options.connect.compressors {
            if registry.by_name(name).is_some() {
                offered.push(name.clone());
            } else {
                tracing::warn!("[CLIENT] Ignoring unknown compressor {:?}", name);
            }
        }

        let handshake = handshake.unwrap_or_else(|| {
            Arc::new(HelloHandshake::new(options.app_name.clone(), offered.clone()))
        });
        let mut connect = options.connect.clone();
        connect.compressors = offered;

        Ok(Arc::new(TcpConnector::new(address, connect, handshake)))
    }

    /// Run `command` against `database` and return the reply.
    ///
    /// Runs on `on_connection` when given, otherwise on a checked-out connection.
    /// A reply with `ok != 1` becomes [`DriverError::Command`](crate::DriverError::Command).
    pub async fn execute(
        &self,
        database: &str,
        command: Document,
        on_connection: Option<&Connection>,
    ) -> DriverResult<Document> {
        let command = with_database(command, database);
        let timeout = self.options.request_timeout;

        let reply = match on_connection {
            Some(connection) => connection.command(command, timeout).await?,
            None => {
                let connection = self.pool.checkout().await?;
                connection.command(command, timeout).await?
            }
        };

        check_ok(&reply)?;
        Ok(reply)
    }

    /// Run a cursor-producing command (`find`, `aggregate`, `listCollections`, ...)
    /// and return a cursor over its results.
    pub async fn open_cursor(&self, database: &str, command: Document) -> DriverResult<Cursor> {
        let batch_size = command
            .get("batchSize")
            .and_then(as_i64)
            .and_then(|n| i32::try_from(n).ok());
        let options = CursorOptions {
            batch_size,
            max_time: None,
            get_more_timeout: self
                .options
                .get_more_timeout
                .or(self.options.request_timeout),
        };
        self.open_cursor_with(database, command, options).await
    }

    pub async fn open_cursor_with(
        &self,
        database: &str,
        command: Document,
        options: CursorOptions,
    ) -> DriverResult<Cursor> {
        let command = with_database(command, database);
        let connection = self.pool.checkout().await?;

        let reply = connection
            .command(command, self.options.request_timeout)
            .await?;
        check_ok(&reply)?;
        Cursor::from_reply(&reply, connection, options)
    }

    pub async fn ping(&self) -> DriverResult<()> {
        self.execute("admin", doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Stop maintenance and drain the pool.
    pub async fn close_all(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        self.pool.close_all().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }
}

fn with_database(mut command: Document, database: &str) -> Document {
    command.insert("$db", Bson::String(database.to_string()));
    command
}
