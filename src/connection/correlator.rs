//! Matches replies to the requests that are waiting for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{DriverError, DriverResult};
use crate::protocol::Message;

type Waiter = oneshot::Sender<DriverResult<Message>>;

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u32, Waiter>,
    /// Set once the connection is gone; later registrations fail immediately.
    lost: Option<String>,
}

/// Per-connection table of in-flight requests.
///
/// Every registered request gets exactly one outcome: its reply, a timeout,
/// or the connection-lost error.
pub struct Correlator {
    connection_id: u64,
    next_request_id: AtomicU32,
    pending: Mutex<PendingTable>,
    unmatched: AtomicU64,
}

impl Correlator {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            next_request_id: AtomicU32::new(1),
            pending: Mutex::new(PendingTable::default()),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Allocate a request id, never 0 and never reused while anything is pending.
    pub fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.pending.lock().waiters.contains_key(&id) {
                return id;
            }
        }
    }

    /// Start waiting for the reply to `request_id`.
    pub fn register(self: &Arc<Self>, request_id: u32) -> DriverResult<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if let Some(reason) = &pending.lost {
            return Err(DriverError::ConnectionLost {
                connection_id: self.connection_id,
                reason: reason.clone(),
            });
        }
        pending.waiters.insert(request_id, tx);
        drop(pending);

        Ok(PendingRequest {
            request_id,
            receiver: rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand `reply` to whoever is waiting on its `response_to`.
    ///
    /// Returns `false` when nobody is; such replies are counted and dropped.
    pub fn resolve(&self, reply: Message) -> bool {
        let waiter = self.pending.lock().waiters.remove(&reply.response_to);
        match waiter {
            // The receiver may have given up already; that is not an error here.
            Some(tx) => {
                let _ = tx.send(Ok(reply));
                true
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = self.connection_id,
                    response_to = reply.response_to,
                    "[CORRELATOR] Dropping reply with no matching request"
                );
                false
            }
        }
    }

    /// Fail every pending request with `ConnectionLost`, and every later one too.
    /// Returns how many waiters were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let waiters = {
            let mut pending = self.pending.lock();
            if pending.lost.is_none() {
                pending.lost = Some(reason.to_string());
            }
            std::mem::take(&mut pending.waiters)
        };

        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(DriverError::ConnectionLost {
                connection_id: self.connection_id,
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            tracing::debug!(
                connection_id = self.connection_id,
                "[CORRELATOR] Failed {} pending requests: {}",
                count,
                reason
            );
        }
        count
    }

    /// Stop waiting for `request_id` without an outcome.
    pub fn forget(&self, request_id: u32) {
        self.pending.lock().waiters.remove(&request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn is_lost(&self) -> bool {
        self.pending.lock().lost.is_some()
    }
}

/// A request that was sent and is awaiting its reply.
///
/// Dropping it unregisters the request; a late reply is then counted as unmatched.
pub struct PendingRequest {
    request_id: u32,
    receiver: oneshot::Receiver<DriverResult<Message>>,
    correlator: Arc<Correlator>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Wait for the reply, up to `timeout` when one is given.
    pub async fn wait(mut self, timeout: Option<Duration>) -> DriverResult<Message> {
        let outcome = match timeout {
            None => (&mut self.receiver).await,
            Some(after) => match tokio::time::timeout(after, &mut self.receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(
                        connection_id = self.correlator.connection_id,
                        request_id = self.request_id,
                        "[CORRELATOR] Request timed out after {:?}",
                        after
                    );
                    return Err(DriverError::Timeout {
                        operation: "reply",
                        after,
                    });
                }
            },
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(DriverError::ConnectionLost {
                connection_id: self.correlator.connection_id,
                reason: "reply channel closed".to_string(),
            }),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.forget(self.request_id);
    }
}
