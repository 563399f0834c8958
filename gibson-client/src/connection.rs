//! # Pipelined Connection
//!
//! Purpose: Own one stream socket, send encoded commands, and hand decoded
//! replies back to callers in the order the commands were sent.
//!
//! ## Design Principles
//! 1. **Queue-Ordered Correlation**: The wire carries no request id, so a
//!    FIFO of pending calls is the only link between a reply and its caller.
//!    A frame is queued for writing and its pending call recorded under one
//!    lock, making send order and FIFO order identical.
//! 2. **Task Per Direction**: A reader task drains the socket into the
//!    decoder; a writer task drains an unbounded frame queue into the socket.
//!    Callers never touch the socket, so dropping a caller's future cannot
//!    leave half a frame on the wire.
//! 3. **Exactly-Once Resolution**: Every pending call is resolved once, by a
//!    reply or by teardown (cancelled on clean close, failed otherwise).
//! 4. **Synchronous Close**: `close` is idempotent and non-async; `wait_closed`
//!    observes the reader task actually finishing.
//!
//! ## Lifecycle
//!
//! ```text
//! Open --(EOF / fatal decode / write error)--> Closing --> Closed
//!   \-------------------(close)----------------------------/
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use gibson_common::{encode_command, Arg, Charset, Command, Decoder, GibsonError, GibsonResult, Reply};

/// Default number of bytes requested from the socket per read.
pub const MAX_CHUNK_SIZE: usize = 65536;

/// Default Gibson TCP port.
pub const DEFAULT_PORT: u16 = 10128;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a Gibson server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Address {
    /// TCP host and port.
    Tcp { host: String, port: u16 },
    /// Local stream socket path.
    Unix(PathBuf),
}

impl Address {
    /// Builds a TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Builds a Unix socket address.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Address::Unix(path.into())
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::tcp("127.0.0.1", DEFAULT_PORT)
    }
}

impl FromStr for Address {
    type Err = GibsonError;

    /// Anything containing a `/` is a socket path, otherwise `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            return Ok(Address::unix(s));
        }
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            GibsonError::Config(format!("address {s:?} is neither host:port nor a socket path"))
        })?;
        let port = port
            .parse::<u16>()
            .map_err(|err| GibsonError::Config(format!("invalid port in {s:?}: {err}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(GibsonError::Config(format!("missing host in {s:?}")));
        }
        Ok(Address::tcp(host, port))
    }
}

impl TryFrom<String> for Address {
    type Error = GibsonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Charset applied to plain values when a call does not override it.
    pub charset: Option<Charset>,
    /// Bytes requested from the socket per read.
    pub read_chunk_size: usize,
    /// Optional connect timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Disable Nagle on TCP sockets.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            charset: None,
            read_chunk_size: MAX_CHUNK_SIZE,
            connect_timeout_ms: None,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

type ReplySlot = oneshot::Sender<GibsonResult<Reply>>;

/// Bookkeeping for one sent command awaiting its reply.
struct PendingCall {
    slot: ReplySlot,
    charset: Option<Charset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct State {
    phase: Phase,
    pending: VecDeque<PendingCall>,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    error: Option<GibsonError>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Shared {
    id: u64,
    state: Mutex<State>,
}

impl Shared {
    /// Queues a frame and records its pending call atomically.
    fn submit(
        &self,
        frame: Bytes,
        charset: Option<Charset>,
    ) -> GibsonResult<oneshot::Receiver<GibsonResult<Reply>>> {
        let mut state = self.state.lock();
        if state.phase != Phase::Open {
            return Err(GibsonError::ConnectionClosed);
        }
        let outgoing = state.outgoing.as_ref().ok_or(GibsonError::ConnectionClosed)?;
        outgoing.send(frame).map_err(|_| GibsonError::ConnectionClosed)?;

        let (slot, receiver) = oneshot::channel();
        state.pending.push_back(PendingCall { slot, charset });
        Ok(receiver)
    }

    /// Hands a decoded reply to the oldest pending call.
    fn deliver(&self, reply: Reply) -> GibsonResult<()> {
        let call = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return Err(GibsonError::ConnectionClosed);
            }
            state.pending.pop_front()
        };
        let call = call.ok_or_else(|| GibsonError::protocol("reply received with no pending call"))?;

        if call.slot.is_closed() {
            tracing::trace!(connection = self.id, "discarding reply for cancelled call");
            return Ok(());
        }
        let result = reply.into_result().and_then(|reply| match call.charset {
            Some(charset) => charset.decode_reply(reply),
            None => Ok(reply),
        });
        let _ = call.slot.send(result);
        Ok(())
    }

    /// Leaves `Open`, recording the cause so a racing `close` still reports it.
    fn mark_closing(&self, error: Option<&GibsonError>) {
        let mut state = self.state.lock();
        if state.phase == Phase::Open {
            state.phase = Phase::Closing;
            if state.error.is_none() {
                state.error = error.cloned();
            }
        }
    }

    /// Moves to `Closed` and resolves every pending call. Idempotent.
    fn teardown(&self, error: Option<GibsonError>) {
        let (pending, reader, writer, error) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            // A cause recorded while closing wins over a clean close.
            let error = state.error.take().or(error);
            state.error = error.clone();
            state.outgoing = None;
            (
                mem::take(&mut state.pending),
                state.reader.take(),
                state.writer.take(),
                error,
            )
        };

        if let Some(handle) = writer {
            handle.abort();
        }
        if let Some(handle) = reader {
            handle.abort();
        }

        let outstanding = pending.len();
        for call in pending {
            let result = match &error {
                Some(err) => Err(err.clone()),
                None => Err(GibsonError::Cancelled),
            };
            let _ = call.slot.send(result);
        }

        match &error {
            Some(err) => {
                tracing::warn!(connection = self.id, outstanding, error = %err, "connection torn down")
            }
            None => tracing::debug!(connection = self.id, outstanding, "connection closed"),
        }
    }
}

/// Publishes teardown completion when the reader task ends, even if aborted.
struct ClosedSignal(watch::Sender<bool>);

impl Drop for ClosedSignal {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// A single pipelined connection to a Gibson server.
///
/// Replies are matched to calls strictly in send order; do not share one
/// connection with code that expects out-of-order replies. Dropping the
/// connection closes it.
pub struct Connection {
    shared: Arc<Shared>,
    address: Option<Address>,
    charset: Option<Charset>,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Opens a connection to `address`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn connect(address: &Address, config: &ConnectionConfig) -> GibsonResult<Self> {
        let connecting = Self::open(address, config);
        match config.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, connecting).await.map_err(|_| {
                GibsonError::from(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                ))
            })?,
            None => connecting.await,
        }
    }

    async fn open(address: &Address, config: &ConnectionConfig) -> GibsonResult<Self> {
        match address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(config.nodelay)?;
                let (reader, writer) = stream.into_split();
                Ok(Self::spawn(reader, writer, Some(address.clone()), config))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (reader, writer) = stream.into_split();
                Ok(Self::spawn(reader, writer, Some(address.clone()), config))
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(GibsonError::from(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets are unavailable: {}", path.display()),
            ))),
        }
    }

    /// Wraps an already-connected stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: &ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::spawn(reader, writer, None, config)
    }

    fn spawn<R, W>(reader: R, writer: W, address: Option<Address>, config: &ConnectionConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(State {
                phase: Phase::Open,
                pending: VecDeque::new(),
                outgoing: Some(frames_tx),
                error: None,
                reader: None,
                writer: None,
            }),
        });

        let chunk_size = config.read_chunk_size.max(1);
        let reader_task = tokio::spawn(read_loop(
            shared.clone(),
            reader,
            chunk_size,
            ClosedSignal(closed_tx),
        ));
        let writer_task = tokio::spawn(write_loop(shared.clone(), writer, frames_rx));
        {
            let mut state = shared.state.lock();
            if state.phase == Phase::Closed {
                writer_task.abort();
            } else {
                state.reader = Some(reader_task);
                state.writer = Some(writer_task);
            }
        }

        match &address {
            Some(address) => tracing::debug!(connection = id, %address, "connection opened"),
            None => tracing::debug!(connection = id, "connection opened on stream"),
        }

        Connection {
            shared,
            address,
            charset: config.charset,
            closed: closed_rx,
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote address, when connected through [`Connection::connect`].
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Default charset for plain values.
    pub fn charset(&self) -> Option<Charset> {
        self.charset
    }

    /// Sends a command using the connection's default charset.
    ///
    /// See [`Connection::execute_with_charset`].
    pub fn execute(
        &self,
        command: Command,
        args: &[Arg<'_>],
    ) -> impl Future<Output = GibsonResult<Reply>> + Send + 'static {
        self.execute_with_charset(command, args, self.charset)
    }

    /// Sends a command and returns a future resolving to its reply.
    ///
    /// The command is encoded and queued before this returns, so calling
    /// `execute` several times pipelines the commands in call order. Dropping
    /// the returned future abandons the reply but keeps its place in the
    /// queue. Encoding failures are reported without writing anything.
    pub fn execute_with_charset(
        &self,
        command: Command,
        args: &[Arg<'_>],
        charset: Option<Charset>,
    ) -> impl Future<Output = GibsonResult<Reply>> + Send + 'static {
        let submitted = encode_command(command, args).and_then(|frame| {
            tracing::trace!(connection = self.shared.id, %command, len = frame.len(), "queue command");
            self.shared.submit(frame, charset)
        });
        async move {
            match submitted?.await {
                Ok(result) => result,
                Err(_) => Err(GibsonError::Cancelled),
            }
        }
    }

    /// Closes the connection immediately. Safe to call repeatedly.
    ///
    /// Pending calls are cancelled unless the connection already failed, in
    /// which case they observed that error.
    pub fn close(&self) {
        self.shared.teardown(None);
    }

    /// True once the connection is closing or closed.
    ///
    /// A reader task that already stopped (peer EOF) triggers the close here.
    pub fn is_closed(&self) -> bool {
        let reader_done = {
            let state = self.shared.state.lock();
            if state.phase != Phase::Open {
                return true;
            }
            state.reader.as_ref().is_some_and(|handle| handle.is_finished())
        };
        if reader_done {
            self.shared.teardown(None);
        }
        reader_done
    }

    /// Waits until the reader task has finished.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Error that tore the connection down, if any.
    pub fn error(&self) -> Option<GibsonError> {
        self.shared.state.lock().error.clone()
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.teardown(None);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.address)
            .finish()
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, chunk_size: usize, _signal: ClosedSignal)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::with_capacity(chunk_size);
    let outcome = 'read: loop {
        loop {
            match decoder.decode() {
                Ok(Some(reply)) => {
                    if let Err(err) = shared.deliver(reply) {
                        break 'read Some(err);
                    }
                }
                Ok(None) => break,
                Err(err) => break 'read Some(err),
            }
        }

        let buffer = decoder.buffer_mut();
        buffer.reserve(chunk_size);
        match reader.read_buf(buffer).await {
            Ok(0) if decoder.is_idle() => break None,
            Ok(0) => {
                break Some(GibsonError::protocol(format!(
                    "eof inside a frame, {} bytes buffered",
                    decoder.buffered()
                )))
            }
            Ok(read) => tracing::trace!(connection = shared.id, read, "socket read"),
            Err(err) => break Some(err.into()),
        }
    };

    shared.mark_closing(outcome.as_ref());
    shared.teardown(outcome);
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut frames: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(err) = written.await {
            let err = GibsonError::from(err);
            shared.mark_closing(Some(&err));
            shared.teardown(Some(err));
            return;
        }
    }
    let _ = writer.shutdown().await;
}
