//! Server-side result cursors.
//!
//! A cursor is created from the first reply of a `find`/`aggregate`-style command
//! and stays pinned to the connection that ran it: the server only knows the cursor
//! on that connection. Further batches are fetched with `getMore` as the buffer
//! runs dry. The connection goes back to the pool as soon as the server reports
//! the cursor exhausted; a cursor abandoned earlier is killed with `killCursors`.

use std::collections::VecDeque;
use std::time::Duration;

use bson::{doc, Bson, Document};
use futures::Stream;

use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::pool::PooledConnection;
use crate::protocol::reply::{as_i64, check_ok};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Only the first batch has been received.
    Initial,
    /// At least one `getMore` has run and the server cursor is still open.
    Active,
    /// The server has nothing more; only buffered documents remain.
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// `batchSize` sent with every `getMore`.
    pub batch_size: Option<i32>,
    /// `maxTimeMS` sent with every `getMore`.
    pub max_time: Option<Duration>,
    /// Client-side deadline for each `getMore` round trip.
    pub get_more_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct Cursor {
    id: i64,
    database: String,
    collection: String,
    buffer: VecDeque<Document>,
    connection: Option<PooledConnection>,
    options: CursorOptions,
    state: CursorState,
}

impl Cursor {
    /// Build a cursor from a reply carrying `cursor: { id, ns, firstBatch }`.
    pub fn from_reply(
        reply: &Document,
        connection: PooledConnection,
        options: CursorOptions,
    ) -> DriverResult<Self> {
        let (id, batch) = parse_batch(reply, "firstBatch")?;
        let ns = reply
            .get_document("cursor")
            .and_then(|cursor| cursor.get_str("ns"))
            .map_err(|_| DriverError::InvalidReply("cursor reply has no ns".to_string()))?;
        let (database, collection) = ns
            .split_once('.')
            .ok_or_else(|| DriverError::InvalidReply(format!("invalid namespace {ns:?}")))?;

        let mut cursor = Self {
            id,
            database: database.to_string(),
            collection: collection.to_string(),
            buffer: batch.into(),
            connection: Some(connection),
            options,
            state: CursorState::Initial,
        };
        if id == 0 {
            cursor.finish();
        }

        tracing::debug!(
            cursor_id = id,
            "[CURSOR] Opened on {} with {} documents",
            cursor.namespace(),
            cursor.buffer.len()
        );
        Ok(cursor)
    }

    /// The next document, fetching another batch when the buffer is empty.
    ///
    /// Returns `Ok(None)` once the cursor is exhausted, without further I/O.
    pub async fn next(&mut self) -> DriverResult<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if self.state == CursorState::Exhausted {
                return Ok(None);
            }
            self.get_more().await?;
        }
    }

    async fn get_more(&mut self) -> DriverResult<()> {
        let Some(connection) = self.connection.as_ref() else {
            self.finish();
            return Ok(());
        };

        let mut command = doc! {
            "getMore": self.id,
            "collection": self.collection.as_str(),
            "$db": self.database.as_str(),
        };
        if let Some(batch_size) = self.options.batch_size {
            command.insert("batchSize", batch_size);
        }
        if let Some(max_time) = self.options.max_time {
            command.insert("maxTimeMS", max_time.as_millis() as i64);
        }

        let result = connection
            .command(command, self.options.get_more_timeout)
            .await
            .and_then(|reply| {
                check_ok(&reply)?;
                parse_batch(&reply, "nextBatch")
            });

        match result {
            Ok((id, batch)) => {
                tracing::debug!(
                    cursor_id = self.id,
                    "[CURSOR] getMore returned {} documents",
                    batch.len()
                );
                self.buffer.extend(batch);
                self.id = id;
                if id == 0 {
                    self.finish();
                } else {
                    self.state = CursorState::Active;
                }
                Ok(())
            }
            Err(e) => {
                tracing::debug!(cursor_id = self.id, "[CURSOR] getMore failed: {}", e);
                let id = std::mem::replace(&mut self.id, 0);
                let connection = self.connection.take();
                self.finish();
                // A timed-out cursor is still open on the server.
                if e.is_timeout() {
                    if let Some(connection) = connection {
                        self.spawn_kill(connection, id);
                    }
                }
                Err(e)
            }
        }
    }

    /// Mark the server side done and hand the connection back.
    fn finish(&mut self) {
        self.id = 0;
        self.state = CursorState::Exhausted;
        self.connection = None;
    }

    /// Kill the server cursor if it is still open and release the connection.
    ///
    /// Failures are logged, not returned.
    pub async fn close(&mut self) {
        self.buffer.clear();
        let id = self.id;
        let connection = self.connection.take();
        self.finish();

        if id == 0 {
            return;
        }
        if let Some(connection) = connection {
            if let Err(e) = kill_cursor(
                &connection,
                &self.database,
                &self.collection,
                id,
                self.options.get_more_timeout,
            )
            .await
            {
                tracing::warn!(cursor_id = id, "[CURSOR] Failed to kill cursor: {}", e);
            }
        }
    }

    fn spawn_kill(&self, connection: PooledConnection, id: i64) {
        let database = self.database.clone();
        let collection = self.collection.clone();
        let timeout = self.options.get_more_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = kill_cursor(&connection, &database, &collection, id, timeout).await {
                        tracing::warn!(cursor_id = id, "[CURSOR] Failed to kill cursor: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    cursor_id = id,
                    "[CURSOR] No runtime to kill cursor on {}.{}",
                    database,
                    collection
                );
            }
        }
    }

    /// Consume the cursor as a stream of documents. The stream ends after the
    /// first error.
    pub fn into_stream(mut self) -> impl Stream<Item = DriverResult<Document>> + Send {
        async_stream::try_stream! {
            while let Some(doc) = self.next().await? {
                yield doc;
            }
        }
    }

    /// Server cursor id; 0 once exhausted.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Documents received but not yet returned by [`next`](Self::next).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether [`next`](Self::next) will return `None`.
    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted && self.buffer.is_empty()
    }

    /// Id of the connection the cursor is pinned to, while it holds one.
    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.id())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        if let Some(connection) = self.connection.take() {
            tracing::debug!(cursor_id = self.id, "[CURSOR] Dropped before exhaustion");
            self.spawn_kill(connection, self.id);
        }
    }
}

async fn kill_cursor(
    connection: &Connection,
    database: &str,
    collection: &str,
    id: i64,
    timeout: Option<Duration>,
) -> DriverResult<()> {
    let command = doc! {
        "killCursors": collection,
        "cursors": [id],
        "$db": database,
    };
    let reply = connection.command(command, timeout).await?;
    check_ok(&reply)
}

/// Read `cursor.id` and the batch under `cursor.<key>`.
fn parse_batch(reply: &Document, key: &str) -> DriverResult<(i64, Vec<Document>)> {
    let cursor = reply
        .get_document("cursor")
        .map_err(|_| DriverError::InvalidReply("reply has no cursor document".to_string()))?;
    let id = cursor
        .get("id")
        .and_then(as_i64)
        .ok_or_else(|| DriverError::InvalidReply("cursor has no id".to_string()))?;
    let batch = cursor
        .get_array(key)
        .map_err(|_| DriverError::InvalidReply(format!("cursor has no {key}")))?;

    let documents = batch
        .iter()
        .map(|value| match value {
            Bson::Document(doc) => Ok(doc.clone()),
            other => Err(DriverError::InvalidReply(format!(
                "{key} holds a non-document value: {other}"
            ))),
        })
        .collect::<DriverResult<Vec<_>>>()?;
    Ok((id, documents))
}
