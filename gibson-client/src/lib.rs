//! # Gibson Async Client
//!
//! Purpose: Talk to a Gibson cache server over TCP or a Unix socket, with
//! pipelined connections and a bounded connection pool.
//!
//! ## Design Principles
//! 1. **Order Is Correlation**: Replies carry no request id, so each
//!    connection matches them to calls through a FIFO of pending calls.
//! 2. **Object Pool Pattern**: Reuse connections instead of reconnecting.
//! 3. **Fail Loudly**: Stream corruption closes the connection and fails every
//!    pending call; nothing retries or reconnects behind the caller's back.
//! 4. **Scoped Resources**: Pooled connections return on drop.

mod client;
mod connection;
mod pool;

pub use client::{Executor, Gibson, MetaField};
pub use connection::{Address, Connection, ConnectionConfig, DEFAULT_PORT, MAX_CHUNK_SIZE};
pub use gibson_common::{
    Arg, Charset, Command, GibsonError, GibsonResult, Reply, ReplyError, Value,
};
pub use pool::{create_pool, ConnectionPool, PoolConfig, PooledConnection};
