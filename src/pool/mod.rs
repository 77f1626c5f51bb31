//! Bounded connection pool.
//!
//! All bookkeeping lives in one [`PoolState`] behind a synchronous lock that is
//! never held across an await. A checkout reuses an idle connection, reserves
//! capacity to dial a new one, or queues behind earlier callers. Returned
//! connections and freed capacity are handed straight to the oldest waiter, so
//! saturated checkouts are served in arrival order.

pub mod connector;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{Connection, ConnectionHandle, ConnectionState};
use crate::error::{DriverError, DriverResult};
use crate::options::PoolOptions;

pub use connector::{Connector, TcpConnector};

/// What a queued checkout receives.
enum Grant {
    Connection(Connection),
    /// A reserved slot; the receiver dials its own connection.
    Capacity,
}

struct IdleEntry {
    connection: Connection,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleEntry>,
    /// Open or being opened, idle or not.
    live: usize,
    /// Handed out, including reservations still dialling.
    checked_out: usize,
    lent: HashMap<u64, ConnectionHandle>,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closing: bool,
}

impl PoolState {
    /// Give `grant` to the oldest waiter still listening; returns it when there is none.
    fn hand_off(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// Release one slot, passing it on to a waiter if any.
    fn free_slot(&mut self) {
        if self.hand_off(Grant::Capacity).is_some() {
            self.live -= 1;
            self.checked_out -= 1;
        }
    }

    fn waiting(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiters: usize,
    pub total_created: u64,
    /// Checkouts that had to queue.
    pub total_waited: u64,
}

struct PoolInner {
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    drained: Notify,
    next_connection_id: AtomicU64,
    total_created: AtomicU64,
    total_waited: AtomicU64,
}

impl PoolInner {
    fn is_reusable(&self, entry: &IdleEntry) -> bool {
        entry.connection.state() == ConnectionState::Ready
            && self
                .options
                .max_idle_time
                .map_or(true, |max| entry.idle_since.elapsed() < max)
    }

    /// Take back a checked-out connection.
    fn release(&self, connection: Connection) {
        let mut state = self.state.lock();
        state.lent.remove(&connection.id());

        let discard = state.closing || connection.state() != ConnectionState::Ready;
        if discard {
            state.free_slot();
        } else if let Some(Grant::Connection(connection)) =
            state.hand_off(Grant::Connection(connection))
        {
            state.checked_out -= 1;
            state.idle.push_back(IdleEntry {
                connection,
                idle_since: Instant::now(),
            });
        }

        let drained = state.checked_out == 0;
        drop(state);
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Give up a reservation that never produced a connection.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.free_slot();
        let drained = state.checked_out == 0;
        drop(state);
        if drained {
            self.drained.notify_waiters();
        }
    }

    fn forget(&self, connection: &Connection) {
        let mut state = self.state.lock();
        state.lent.remove(&connection.id());
        state.free_slot();
    }
}

/// Returns a reserved slot to the pool unless disarmed.
struct SlotGuard<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// A queued checkout. Anything granted after the caller gave up is given back.
struct WaitSlot<'a> {
    pool: &'a PoolInner,
    receiver: oneshot::Receiver<Grant>,
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.receiver.close();
        match self.receiver.try_recv() {
            Ok(Grant::Connection(connection)) => self.pool.release(connection),
            Ok(Grant::Capacity) => self.pool.release_slot(),
            Err(_) => {}
        }
    }
}

enum Step {
    Reuse(Connection),
    Create,
    Wait(oneshot::Receiver<Grant>),
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(options: PoolOptions, connector: Arc<dyn Connector>) -> DriverResult<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                options,
                connector,
                state: Mutex::new(PoolState::default()),
                drained: Notify::new(),
                next_connection_id: AtomicU64::new(1),
                total_created: AtomicU64::new(0),
                total_waited: AtomicU64::new(0),
            }),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Check out a connection, waiting at most the configured `checkout_timeout`.
    pub async fn checkout(&self) -> DriverResult<PooledConnection> {
        self.checkout_timeout(self.inner.options.checkout_timeout).await
    }

    /// Check out a connection, waiting at most `timeout` (`None` waits forever).
    pub async fn checkout_timeout(&self, timeout: Option<Duration>) -> DriverResult<PooledConnection> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let (step, stale) = {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(DriverError::PoolClosed);
            }

            let mut stale = Vec::new();
            let mut reused = None;
            while let Some(entry) = state.idle.pop_back() {
                if self.inner.is_reusable(&entry) {
                    reused = Some(entry.connection);
                    break;
                }
                state.live -= 1;
                stale.push(entry.connection);
            }

            let step = match reused {
                Some(connection) => {
                    state.checked_out += 1;
                    Step::Reuse(connection)
                }
                None if state.live < self.inner.options.max_pool_size => {
                    state.live += 1;
                    state.checked_out += 1;
                    Step::Create
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.retain(|w| !w.is_closed());
                    state.waiters.push_back(tx);
                    Step::Wait(rx)
                }
            };
            (step, stale)
        };

        for connection in stale {
            tracing::debug!(connection_id = connection.id(), "[POOL] Discarding stale idle connection");
            connection.close();
        }

        match step {
            Step::Reuse(connection) => {
                tracing::debug!(connection_id = connection.id(), "[POOL] Reusing idle connection");
                Ok(self.lend(connection))
            }
            Step::Create => self.create(deadline, started).await,
            Step::Wait(receiver) => {
                self.inner.total_waited.fetch_add(1, Ordering::Relaxed);
                let mut slot = WaitSlot {
                    pool: &self.inner,
                    receiver,
                };

                let received = match deadline {
                    None => Some((&mut slot.receiver).await),
                    Some(deadline) => tokio::time::timeout_at(deadline, &mut slot.receiver)
                        .await
                        .ok(),
                };
                let grant = match received {
                    Some(Ok(grant)) => grant,
                    Some(Err(_)) => return Err(DriverError::PoolClosed),
                    None => {
                        // A grant may have raced the deadline.
                        slot.receiver.close();
                        match slot.receiver.try_recv() {
                            Ok(grant) => grant,
                            Err(_) => {
                                return Err(DriverError::PoolExhausted {
                                    waited: started.elapsed(),
                                })
                            }
                        }
                    }
                };
                drop(slot);

                match grant {
                    Grant::Connection(connection) => {
                        tracing::debug!(
                            connection_id = connection.id(),
                            "[POOL] Received connection after waiting {:?}",
                            started.elapsed()
                        );
                        Ok(self.lend(connection))
                    }
                    Grant::Capacity => self.create(deadline, started).await,
                }
            }
        }
    }

    /// Return a connection. Dropping the [`PooledConnection`] does the same.
    pub fn checkin(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Dial a connection into a slot that is already reserved. The slot is
    /// given back if dialling fails or runs past `deadline`.
    async fn create(
        &self,
        deadline: Option<Instant>,
        started: Instant,
    ) -> DriverResult<PooledConnection> {
        let mut guard = SlotGuard {
            pool: &self.inner,
            armed: true,
        };
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connecting = self.inner.connector.connect(id);
        let connection = match deadline {
            None => connecting.await?,
            Some(deadline) => match tokio::time::timeout_at(deadline, connecting).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(
                        connection_id = id,
                        "[POOL] Checkout deadline passed while dialling"
                    );
                    return Err(DriverError::PoolExhausted {
                        waited: started.elapsed(),
                    });
                }
            },
        };
        guard.armed = false;

        self.inner.total_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection_id = id,
            address = %connection.address(),
            "[POOL] Opened new connection"
        );
        Ok(self.lend(connection))
    }

    fn lend(&self, connection: Connection) -> PooledConnection {
        self.inner
            .state
            .lock()
            .lent
            .insert(connection.id(), connection.handle());
        PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Open connections until `min_pool_size` are live. Returns how many were opened.
    pub async fn prewarm(&self) -> DriverResult<usize> {
        let mut opened = 0;
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closing || state.live >= self.inner.options.min_pool_size {
                    break;
                }
                state.live += 1;
                state.checked_out += 1;
            }

            let pooled = self.create(None, Instant::now()).await?;
            drop(pooled);
            opened += 1;
        }

        if opened > 0 {
            tracing::debug!("[POOL] Pre-warmed {} connections", opened);
        }
        Ok(opened)
    }

    /// Close idle connections past `max_idle_time` or no longer usable.
    pub fn evict_idle(&self) -> usize {
        let evicted: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            let (keep, evict): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|entry| self.inner.is_reusable(entry));
            state.idle = keep;
            state.live -= evict.len();

            // Freed slots go to anyone queued.
            for _ in 0..evict.len() {
                if state.waiters.is_empty() {
                    break;
                }
                state.live += 1;
                state.checked_out += 1;
                state.free_slot();
            }
            evict.into_iter().map(|entry| entry.connection).collect()
        };

        for connection in &evicted {
            connection.close();
        }
        if !evicted.is_empty() {
            tracing::debug!("[POOL] Evicted {} idle connections", evicted.len());
        }
        evicted.len()
    }

    /// Run eviction and pre-warming every `maintenance_interval` until the pool
    /// is closed or dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.options.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }

                pool.evict_idle();
                if let Err(e) = pool.prewarm().await {
                    tracing::warn!("[POOL] Failed to top up connections: {}", e);
                }
            }
            tracing::debug!("[POOL] Maintenance task stopped");
        })
    }

    /// Shut the pool down.
    ///
    /// New checkouts fail with `PoolClosed` at once, as do queued ones. Connections
    /// in use are marked draining and given up to `drain_timeout` to come back;
    /// anything still out after that is closed underneath its holder.
    pub async fn close_all(&self) {
        let (idle, waiters, lent) = {
            let mut state = self.inner.state.lock();
            state.closing = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            let waiters = std::mem::take(&mut state.waiters);
            let lent: Vec<ConnectionHandle> = state.lent.values().cloned().collect();
            (idle, waiters, lent)
        };

        // Dropped senders wake their waiters with `PoolClosed`.
        drop(waiters);
        for entry in &idle {
            entry.connection.close();
        }
        for handle in &lent {
            handle.mark_draining();
        }

        tracing::info!(
            "[POOL] Draining: closed {} idle connections, waiting for {} in use",
            idle.len(),
            lent.len()
        );

        let deadline = Instant::now() + self.inner.options.drain_timeout;
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.state.lock().checked_out == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let stragglers: Vec<ConnectionHandle> =
                    self.inner.state.lock().lent.values().cloned().collect();
                tracing::warn!(
                    "[POOL] Drain timed out; closing {} connections still in use",
                    stragglers.len()
                );
                for handle in stragglers {
                    handle.close("pool closed");
                }
                break;
            }
        }

        tracing::info!("[POOL] Pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closing
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            waiters: state.waiting(),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_waited: self.inner.total_waited.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out connection; returned to its pool when dropped.
pub struct PooledConnection {
    connection: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Take the connection out of the pool for good, freeing its slot.
    pub fn detach(mut self) -> Option<Connection> {
        let connection = self.connection.take()?;
        self.pool.forget(&connection);
        Some(connection)
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection")
            .field(&self.connection)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
