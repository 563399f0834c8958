//! # Typed Command API
//!
//! Purpose: Expose every Gibson command as a typed async method on top of
//! anything that can execute raw commands.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Gibson` hides opcodes and reply shapes.
//! 2. **Closed Capability Set**: Commands are inherent methods; by-name
//!    dispatch goes through `Command::from_name` and fails loudly.
//! 3. **Thin Layer**: No protocol or concurrency logic lives here, only
//!    argument building and reply post-processing.

use std::fmt;
use std::future::Future;

use bytes::Bytes;

use gibson_common::{Arg, Charset, Command, GibsonError, GibsonResult, Reply, Value};

use crate::connection::{Address, Connection, ConnectionConfig};

/// Something that can run one raw command and return its decoded reply.
pub trait Executor {
    /// Runs `command` with `args`, decoding plain values with `charset`.
    fn execute_with_charset(
        &self,
        command: Command,
        args: &[Arg<'_>],
        charset: Option<Charset>,
    ) -> impl Future<Output = GibsonResult<Reply>> + Send;

    /// Charset applied when the caller does not pick one.
    fn default_charset(&self) -> Option<Charset>;

    /// Runs `command` with the default charset.
    fn execute(&self, command: Command, args: &[Arg<'_>]) -> impl Future<Output = GibsonResult<Reply>> + Send {
        self.execute_with_charset(command, args, self.default_charset())
    }
}

impl Executor for Connection {
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

impl<E: Executor> Executor for &E {
    fn execute_with_charset(
        &self,
        command: Command,
        args: &[Arg<'_>],
        charset: Option<Charset>,
    ) -> impl Future<Output = GibsonResult<Reply>> + Send {
        (**self).execute_with_charset(command, args, charset)
    }

    fn default_charset(&self) -> Option<Charset> {
        (**self).default_charset()
    }
}

/// Item metadata selectable through [`Gibson::meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    /// Value size in bytes.
    Size,
    /// Value encoding (0 plain, 2 number).
    Encoding,
    /// Last access timestamp.
    Access,
    /// Creation timestamp.
    Created,
    /// Configured TTL, -1 for none.
    Ttl,
    /// Seconds left to live, -1 without a TTL.
    Left,
    /// Seconds the item stays locked, -1 without a lock.
    Lock,
}

impl MetaField {
    /// Wire token of the field.
    pub fn name(self) -> &'static str {
        match self {
            MetaField::Size => "size",
            MetaField::Encoding => "encoding",
            MetaField::Access => "access",
            MetaField::Created => "created",
            MetaField::Ttl => "ttl",
            MetaField::Left => "left",
            MetaField::Lock => "lock",
        }
    }
}

/// High-level Gibson client.
///
/// ```no_run
/// use gibson_client::{Address, Gibson};
///
/// # async fn demo() -> gibson_client::GibsonResult<()> {
/// let gibson = Gibson::connect(&Address::default(), &Default::default()).await?;
/// gibson.set("foo", "bar", 3600).await?;
/// assert_eq!(gibson.get("foo").await?.and_then(|v| v.as_bytes().map(<[u8]>::to_vec)), Some(b"bar".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct Gibson<E> {
    executor: E,
}

impl Gibson<Connection> {
    /// Opens a dedicated connection.
    pub async fn connect(address: &Address, config: &ConnectionConfig) -> GibsonResult<Self> {
        Ok(Gibson::new(Connection::connect(address, config).await?))
    }

    /// Closes the underlying connection.
    pub fn close(&self) {
        self.executor.close();
    }

    /// Waits until the underlying connection is torn down.
    pub async fn wait_closed(&self) {
        self.executor.wait_closed().await;
    }

    /// True once the underlying connection is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }
}

impl<E: Executor> Gibson<E> {
    /// Wraps an executor.
    pub fn new(executor: E) -> Self {
        Gibson { executor }
    }

    /// Borrows the executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Returns the executor.
    pub fn into_inner(self) -> E {
        self.executor
    }

    async fn run(&self, command: Command, args: &[Arg<'_>]) -> GibsonResult<Reply> {
        self.executor.execute(command, args).await
    }

    /// Gets a value; `None` when the key is missing.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> GibsonResult<Option<Value>> {
        self.run(Command::Get, &[key.as_ref().into()]).await?.into_value()
    }

    /// Sets a value with an optional TTL in seconds (0 keeps it forever).
    pub async fn set<'a>(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Arg<'a>>,
        expire: u32,
    ) -> GibsonResult<Option<Value>> {
        self.run(Command::Set, &[expire.into(), key.as_ref().into(), value.into()])
            .await?
            .into_value()
    }

    /// Deletes a key; false when it did not exist.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> GibsonResult<bool> {
        truthy(self.run(Command::Del, &[key.as_ref().into()]).await?)
    }

    /// Sets the TTL of a key.
    pub async fn ttl(&self, key: impl AsRef<[u8]>, expire: u32) -> GibsonResult<bool> {
        truthy(self.run(Command::Ttl, &[key.as_ref().into(), expire.into()]).await?)
    }

    /// Increments a numeric value by one and returns the result.
    pub async fn inc(&self, key: impl AsRef<[u8]>) -> GibsonResult<i64> {
        self.run(Command::Inc, &[key.as_ref().into()]).await?.into_int()
    }

    /// Decrements a numeric value by one and returns the result.
    pub async fn dec(&self, key: impl AsRef<[u8]>) -> GibsonResult<i64> {
        self.run(Command::Dec, &[key.as_ref().into()]).await?.into_int()
    }

    /// Locks a key against writes for `expire` seconds.
    pub async fn lock(&self, key: impl AsRef<[u8]>, expire: u32) -> GibsonResult<bool> {
        truthy(self.run(Command::Lock, &[key.as_ref().into(), expire.into()]).await?)
    }

    /// Removes the lock on a key.
    pub async fn unlock(&self, key: impl AsRef<[u8]>) -> GibsonResult<bool> {
        truthy(self.run(Command::Unlock, &[key.as_ref().into()]).await?)
    }

    /// Lists keys starting with `prefix`.
    ///
    /// The server answers with an index/key pair list; only the keys are kept.
    pub async fn keys(&self, prefix: impl AsRef<[u8]>) -> GibsonResult<Vec<Value>> {
        let flat = self.run(Command::Keys, &[prefix.as_ref().into()]).await?.into_flat()?;
        Ok(flat.into_iter().skip(1).step_by(2).collect())
    }

    /// Server statistics as (name, value) pairs.
    pub async fn stats(&self) -> GibsonResult<Vec<(Bytes, Value)>> {
        self.run(Command::Stats, &[]).await?.into_pairs()
    }

    /// Refreshes the client's last-seen time on the server.
    pub async fn ping(&self) -> GibsonResult<bool> {
        truthy(self.run(Command::Ping, &[]).await?)
    }

    /// Reads one metadata field of an item.
    pub async fn meta(&self, key: impl AsRef<[u8]>, field: MetaField) -> GibsonResult<i64> {
        self.run(Command::Meta, &[key.as_ref().into(), field.name().into()])
            .await?
            .into_int()
    }

    /// Asks the server to end the session.
    ///
    /// The server may hang up instead of replying; that counts as success.
    pub async fn end(&self) -> GibsonResult<()> {
        match self.run(Command::End, &[]).await {
            Ok(reply) => reply.into_result().map(drop),
            Err(GibsonError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Sets every key under `prefix`; returns how many were changed.
    pub async fn mset<'a>(&self, prefix: impl AsRef<[u8]>, value: impl Into<Arg<'a>>) -> GibsonResult<i64> {
        count(self.run(Command::MSet, &[prefix.as_ref().into(), value.into()]).await?)
    }

    /// Gets (key, value) pairs under `prefix`, optionally capped at `limit`.
    pub async fn mget(&self, prefix: impl AsRef<[u8]>, limit: Option<u32>) -> GibsonResult<Vec<(Bytes, Value)>> {
        let prefix = prefix.as_ref();
        let reply = match limit {
            Some(limit) => self.run(Command::MGet, &[prefix.into(), limit.into()]).await?,
            None => self.run(Command::MGet, &[prefix.into()]).await?,
        };
        reply.into_pairs()
    }

    /// Sets the TTL of every key under `prefix`.
    pub async fn mttl(&self, prefix: impl AsRef<[u8]>, expire: u32) -> GibsonResult<i64> {
        count(self.run(Command::MTtl, &[prefix.as_ref().into(), expire.into()]).await?)
    }

    /// Increments every key under `prefix`.
    pub async fn minc(&self, prefix: impl AsRef<[u8]>) -> GibsonResult<i64> {
        count(self.run(Command::MInc, &[prefix.as_ref().into()]).await?)
    }

    /// Decrements every key under `prefix`.
    pub async fn mdec(&self, prefix: impl AsRef<[u8]>) -> GibsonResult<i64> {
        count(self.run(Command::MDec, &[prefix.as_ref().into()]).await?)
    }

    /// Locks every key under `prefix` for `expire` seconds.
    pub async fn mlock(&self, prefix: impl AsRef<[u8]>, expire: u32) -> GibsonResult<i64> {
        count(self.run(Command::MLock, &[prefix.as_ref().into(), expire.into()]).await?)
    }

    /// Unlocks every key under `prefix`.
    pub async fn munlock(&self, prefix: impl AsRef<[u8]>) -> GibsonResult<i64> {
        count(self.run(Command::MUnlock, &[prefix.as_ref().into()]).await?)
    }

    /// Deletes every key under `prefix`.
    pub async fn mdelete(&self, prefix: impl AsRef<[u8]>) -> GibsonResult<i64> {
        count(self.run(Command::MDel, &[prefix.as_ref().into()]).await?)
    }

    /// Counts keys under `prefix`.
    pub async fn count(&self, prefix: impl AsRef<[u8]>) -> GibsonResult<i64> {
        count(self.run(Command::Count, &[prefix.as_ref().into()]).await?)
    }
}

impl<E: fmt::Debug> fmt::Debug for Gibson<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gibson").field(&self.executor).finish()
    }
}

fn truthy(reply: Reply) -> GibsonResult<bool> {
    Ok(reply.into_result()?.is_truthy())
}

// Prefix commands answer NOT_FOUND when nothing matched.
fn count(reply: Reply) -> GibsonResult<i64> {
    match reply {
        Reply::Nil => Ok(0),
        other => other.into_int(),
    }
}
