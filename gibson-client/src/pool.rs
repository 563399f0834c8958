//! # Connection Pool
//!
//! Purpose: Reuse pipelined connections across tasks while bounding how many
//! exist at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections wait in a free list; checked-out
//!    ones are tracked by id in a used set.
//! 2. **RAII Checkout**: `acquire` only hands out a `PooledConnection`, which
//!    returns itself on drop, including on error and cancellation paths.
//! 3. **Minimal Locking**: The bookkeeping mutex is never held across an
//!    await; connects happen outside it against a reserved slot.
//! 4. **Bounded Size**: `free + used + connecting <= max_size` at all times.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;

use gibson_common::{Arg, Charset, Command, GibsonError, GibsonResult, Reply};

use crate::client::Executor;
use crate::connection::{Address, Connection, ConnectionConfig};

/// Pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:10128" or "/tmp/gibson.sock".
    pub address: Address,
    /// Idle connections the pool tries to keep around.
    pub min_size: usize,
    /// Maximum total connections (free + in use).
    pub max_size: usize,
    /// Optional limit on how long `acquire` waits, in milliseconds.
    pub acquire_timeout_ms: Option<u64>,
    /// Settings applied to every connection the pool opens.
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            address: Address::default(),
            min_size: 10,
            max_size: 10,
            acquire_timeout_ms: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Builds a default configuration for `address`.
    pub fn new(address: Address) -> Self {
        PoolConfig {
            address,
            ..PoolConfig::default()
        }
    }

    /// Parses a JSON configuration document; missing fields take defaults.
    pub fn from_json(json: &str) -> GibsonResult<Self> {
        let config: PoolConfig =
            serde_json::from_str(json).map_err(|err| GibsonError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks size bounds.
    pub fn validate(&self) -> GibsonResult<()> {
        if self.max_size == 0 {
            return Err(GibsonError::Config("max_size must be at least 1".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(GibsonError::Config(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }

    fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

struct PoolState {
    free: VecDeque<Connection>,
    used: HashSet<u64>,
    connecting: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.free.len() + self.used.len() + self.connecting
    }
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl PoolInner {
    fn release(&self, conn: Connection) {
        let closed = {
            let mut state = self.state.lock();
            let known = state.used.remove(&conn.id());
            debug_assert!(known, "connection {} released to a pool that does not own it", conn.id());
            if conn.is_closed() {
                tracing::debug!(connection = conn.id(), "dropping closed connection on release");
                Some(conn)
            } else {
                // The slot this connection held is still counted against max_size.
                debug_assert!(state.total() < self.config.max_size, "pool over capacity on release");
                state.free.push_back(conn);
                None
            }
        };
        // Closing happens outside the pool lock.
        drop(closed);
        self.released.notify_waiters();
    }
}

/// A slot counted against `max_size` while a connection is being opened.
struct Reservation {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl Reservation {
    fn new(inner: Arc<PoolInner>) -> Self {
        Reservation { inner, armed: true }
    }

    /// Converts the reserved slot into a real entry.
    fn commit(mut self, place: impl FnOnce(&mut PoolState)) {
        self.armed = false;
        let mut state = self.inner.state.lock();
        state.connecting -= 1;
        place(&mut state);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().connecting -= 1;
            self.inner.released.notify_waiters();
        }
    }
}

enum Checkout {
    Ready(Connection),
    Create(Reservation),
    Wait,
}

/// Connection pool handle. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Creates a pool and fills it up to `min_size` connections.
pub async fn create_pool(config: PoolConfig) -> GibsonResult<ConnectionPool> {
    let pool = ConnectionPool::new(config)?;
    pool.fill_free().await?;
    Ok(pool)
}

impl ConnectionPool {
    /// Creates an empty pool; connections open lazily on `acquire`.
    pub fn new(config: PoolConfig) -> GibsonResult<Self> {
        config.validate()?;
        let state = PoolState {
            free: VecDeque::with_capacity(config.max_size),
            used: HashSet::with_capacity(config.max_size),
            connecting: 0,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                released: Notify::new(),
            }),
        })
    }

    /// Minimum idle size.
    pub fn min_size(&self) -> usize {
        self.inner.config.min_size
    }

    /// Maximum total size.
    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Free plus in-use connections.
    pub fn size(&self) -> usize {
        let state = self.inner.state.lock();
        state.free.len() + state.used.len()
    }

    /// Idle connections.
    pub fn free_size(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Checked-out connections.
    pub fn used_size(&self) -> usize {
        self.inner.state.lock().used.len()
    }

    /// Default charset of pooled connections.
    pub fn charset(&self) -> Option<Charset> {
        self.inner.config.connection.charset
    }

    /// Server address.
    pub fn address(&self) -> &Address {
        &self.inner.config.address
    }

    /// Checks out a connection, waiting for a release when the pool is full.
    ///
    /// With `acquire_timeout_ms` set, waiting longer than that fails with
    /// `GibsonError::PoolExhausted`.
    pub async fn acquire(&self) -> GibsonResult<PooledConnection> {
        match self.inner.config.acquire_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.checkout())
                .await
                .map_err(|_| GibsonError::PoolExhausted)?,
            None => self.checkout().await,
        }
    }

    async fn checkout(&self) -> GibsonResult<PooledConnection> {
        self.fill_free().await?;
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_checkout() {
                Checkout::Ready(conn) => return Ok(self.wrap(conn)),
                Checkout::Create(reservation) => {
                    let conn = self.open().await?;
                    let id = conn.id();
                    reservation.commit(|state| {
                        let inserted = state.used.insert(id);
                        debug_assert!(inserted, "connection {id} already in use");
                    });
                    return Ok(self.wrap(conn));
                }
                Checkout::Wait => released.await,
            }
        }
    }

    fn try_checkout(&self) -> Checkout {
        let mut state = self.inner.state.lock();
        while let Some(conn) = state.free.pop_front() {
            if conn.is_closed() {
                tracing::debug!(connection = conn.id(), "discarding closed idle connection");
                continue;
            }
            let inserted = state.used.insert(conn.id());
            debug_assert!(inserted, "connection {} already in use", conn.id());
            return Checkout::Ready(conn);
        }
        if state.total() < self.inner.config.max_size {
            state.connecting += 1;
            return Checkout::Create(Reservation::new(self.inner.clone()));
        }
        Checkout::Wait
    }

    /// Opens connections until `min_size` are idle or `max_size` is reached.
    async fn fill_free(&self) -> GibsonResult<()> {
        loop {
            let reservation = {
                let mut state = self.inner.state.lock();
                if state.free.len() + state.connecting >= self.inner.config.min_size
                    || state.total() >= self.inner.config.max_size
                {
                    return Ok(());
                }
                state.connecting += 1;
                Reservation::new(self.inner.clone())
            };
            let conn = self.open().await?;
            reservation.commit(|state| state.free.push_back(conn));
            self.inner.released.notify_waiters();
        }
    }

    async fn open(&self) -> GibsonResult<Connection> {
        let config = &self.inner.config;
        let conn = Connection::connect(&config.address, &config.connection).await?;
        tracing::debug!(connection = conn.id(), address = %config.address, "pool opened connection");
        Ok(conn)
    }

    fn wrap(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
        }
    }

    /// Closes every idle connection; checked-out connections are untouched.
    pub async fn clear(&self) {
        let drained: Vec<Connection> = self.inner.state.lock().free.drain(..).collect();
        for conn in &drained {
            conn.close();
        }
        for conn in &drained {
            conn.wait_closed().await;
        }
        tracing::debug!(closed = drained.len(), "pool cleared");
        self.inner.released.notify_waiters();
    }

    /// Runs one command on a scoped connection.
    pub async fn execute(&self, command: Command, args: &[Arg<'_>]) -> GibsonResult<Reply> {
        let conn = self.acquire().await?;
        conn.execute(command, args).await
    }

    /// Runs a command looked up by name on a scoped connection.
    ///
    /// # Errors
    /// `UnknownCommand` when `name` is not a Gibson command.
    pub async fn call(&self, name: &str, args: &[Arg<'_>]) -> GibsonResult<Reply> {
        let command = Command::from_name(name)?;
        self.execute(command, args).await
    }
}

impl Executor for ConnectionPool {
    fn execute_with_charset(
        &self,
        command: Command,
        args: &[Arg<'_>],
        charset: Option<Charset>,
    ) -> impl Future<Output = GibsonResult<Reply>> + Send {
        async move {
            let conn = self.acquire().await?;
            conn.execute_with_charset(command, args, charset).await
        }
    }

    fn default_charset(&self) -> Option<Charset> {
        self.charset()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.config.address)
            .field("free", &state.free.len())
            .field("used", &state.used.len())
            .field("max_size", &self.inner.config.max_size)
            .finish()
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Executor for PooledConnection {
    fn execute_with_charset(
        &self,
        command: Command,
        args: &[Arg<'_>],
        charset: Option<Charset>,
    ) -> impl Future<Output = GibsonResult<Reply>> + Send {
        Connection::execute_with_charset(self, command, args, charset)
    }

    fn default_charset(&self) -> Option<Charset> {
        self.charset()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
