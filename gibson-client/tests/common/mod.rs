#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use gibson_client::Address;

pub const REPL_ERR: u16 = 0x00;
pub const REPL_ERR_NOT_FOUND: u16 = 0x01;
pub const REPL_ERR_NAN: u16 = 0x02;
pub const REPL_ERR_MEM: u16 = 0x03;
pub const REPL_ERR_LOCKED: u16 = 0x04;
pub const REPL_OK: u16 = 0x05;
pub const REPL_VAL: u16 = 0x06;
pub const REPL_KVAL: u16 = 0x07;

pub const ENC_PLAIN: u8 = 0x00;
pub const ENC_NUMBER: u8 = 0x02;

/// Installs a fmt subscriber when RUST_LOG is set.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

pub fn frame(code: u16, encoding: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + payload.len());
    out.extend_from_slice(&code.to_le_bytes());
    out.push(encoding);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn status(code: u16) -> Vec<u8> {
    frame(code, ENC_PLAIN, b"")
}

pub fn plain(value: &[u8]) -> Vec<u8> {
    frame(REPL_VAL, ENC_PLAIN, value)
}

pub fn number(value: i64) -> Vec<u8> {
    frame(REPL_VAL, ENC_NUMBER, &value.to_le_bytes())
}

/// Builds a KVAL reply; each value is either plain bytes or a number.
pub fn kval(pairs: &[(&[u8], Entry)]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (key, value) in pairs {
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        let (encoding, data) = match value {
            Entry::Plain(data) => (ENC_PLAIN, data.clone()),
            Entry::Number(value) => (ENC_NUMBER, value.to_le_bytes().to_vec()),
        };
        payload.push(encoding);
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(&data);
    }
    frame(REPL_KVAL, ENC_PLAIN, &payload)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Plain(Vec<u8>),
    Number(i64),
}

/// One decoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: u16,
    pub args: Vec<Vec<u8>>,
}

impl Request {
    pub fn arg(&self, idx: usize) -> &[u8] {
        self.args.get(idx).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Reads one command frame; `None` on a clean EOF.
pub async fn read_command<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Request>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(len) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let op = u16::from_le_bytes([body[0], body[1]]);
    let query = &body[2..];
    let args = if query.is_empty() {
        Vec::new()
    } else {
        query.split(|b| *b == b' ').map(<[u8]>::to_vec).collect()
    };
    Ok(Some(Request { op, args }))
}

pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &[u8]) {
    writer.write_all(reply).await.expect("write reply");
    writer.flush().await.expect("flush reply");
}

#[derive(Default)]
struct Store {
    items: BTreeMap<Vec<u8>, Entry>,
    locked: HashSet<Vec<u8>>,
}

impl Store {
    fn prefixed(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.items
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn store(&mut self, key: &[u8], value: &[u8]) -> Entry {
        let entry = match std::str::from_utf8(value).ok().and_then(|text| text.parse::<i64>().ok()) {
            Some(number) => Entry::Number(number),
            None => Entry::Plain(value.to_vec()),
        };
        self.items.insert(key.to_vec(), entry.clone());
        entry
    }

    fn bump(&mut self, key: &[u8], delta: i64) -> Vec<u8> {
        match self.items.get(key).cloned() {
            Some(Entry::Number(value)) => {
                self.items.insert(key.to_vec(), Entry::Number(value + delta));
                number(value + delta)
            }
            Some(Entry::Plain(_)) => status(REPL_ERR_NAN),
            None => {
                self.items.insert(key.to_vec(), Entry::Number(delta));
                number(delta)
            }
        }
    }

    fn handle(&mut self, req: &Request) -> Option<Vec<u8>> {
        let reply = match req.op {
            // set: ttl key value
            0x01 => {
                let key = req.arg(1);
                if self.locked.contains(key) {
                    status(REPL_ERR_LOCKED)
                } else {
                    match self.store(key, req.arg(2)) {
                        Entry::Plain(data) => plain(&data),
                        Entry::Number(value) => number(value),
                    }
                }
            }
            0x02 => self.exists(req.arg(0)),
            0x03 => match self.items.get(req.arg(0)) {
                Some(Entry::Plain(data)) => plain(data),
                Some(Entry::Number(value)) => number(*value),
                None => status(REPL_ERR_NOT_FOUND),
            },
            0x04 => match self.items.remove(req.arg(0)) {
                Some(_) => status(REPL_OK),
                None => status(REPL_ERR_NOT_FOUND),
            },
            0x05 => self.bump(req.arg(0), 1),
            0x06 => self.bump(req.arg(0), -1),
            0x07 => {
                if self.items.contains_key(req.arg(0)) {
                    self.locked.insert(req.arg(0).to_vec());
                    status(REPL_OK)
                } else {
                    status(REPL_ERR_NOT_FOUND)
                }
            }
            0x08 => match self.locked.remove(req.arg(0)) {
                true => status(REPL_OK),
                false => self.exists(req.arg(0)),
            },
            // mset: prefix value
            0x09 => {
                let keys = self.prefixed(req.arg(0));
                for key in &keys {
                    self.store(key, req.arg(1));
                }
                counted(keys.len())
            }
            0x0A | 0x0F | 0x10 => counted(self.prefixed(req.arg(0)).len()),
            // mget: prefix [limit]
            0x0B => {
                let limit = std::str::from_utf8(req.arg(1))
                    .ok()
                    .and_then(|text| text.parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                let keys = self.prefixed(req.arg(0));
                let pairs: Vec<(&[u8], Entry)> = keys
                    .iter()
                    .take(limit)
                    .map(|key| (key.as_slice(), self.items[key].clone()))
                    .collect();
                if pairs.is_empty() {
                    status(REPL_ERR_NOT_FOUND)
                } else {
                    kval(&pairs)
                }
            }
            0x0C => {
                let keys = self.prefixed(req.arg(0));
                for key in &keys {
                    self.items.remove(key);
                }
                counted(keys.len())
            }
            0x0D | 0x0E => {
                let delta = if req.op == 0x0D { 1 } else { -1 };
                let keys = self.prefixed(req.arg(0));
                for key in &keys {
                    self.bump(key, delta);
                }
                counted(keys.len())
            }
            0x11 => counted(self.prefixed(req.arg(0)).len()),
            0x12 => kval(&[
                (&b"total_items"[..], Entry::Number(self.items.len() as i64)),
                (&b"server_version"[..], Entry::Plain(b"0.2.3".to_vec())),
            ]),
            0x13 => status(REPL_OK),
            0x14 => match (self.items.get(req.arg(0)), req.arg(1)) {
                (Some(Entry::Plain(data)), b"size") => number(data.len() as i64),
                (Some(Entry::Number(_)), b"size") => number(8),
                (Some(Entry::Plain(_)), b"encoding") => number(0),
                (Some(Entry::Number(_)), b"encoding") => number(2),
                (Some(_), _) => number(-1),
                (None, _) => status(REPL_ERR_NOT_FOUND),
            },
            0x15 => {
                let keys = self.prefixed(req.arg(0));
                if keys.is_empty() {
                    status(REPL_ERR_NOT_FOUND)
                } else {
                    let indices: Vec<Vec<u8>> =
                        (0..keys.len()).map(|idx| idx.to_string().into_bytes()).collect();
                    let pairs: Vec<(&[u8], Entry)> = indices
                        .iter()
                        .zip(&keys)
                        .map(|(idx, key)| (idx.as_slice(), Entry::Plain(key.clone())))
                        .collect();
                    kval(&pairs)
                }
            }
            0xFF => return None,
            _ => status(REPL_ERR),
        };
        Some(reply)
    }

    fn exists(&self, key: &[u8]) -> Vec<u8> {
        if self.items.contains_key(key) {
            status(REPL_OK)
        } else {
            status(REPL_ERR_NOT_FOUND)
        }
    }
}

fn counted(count: usize) -> Vec<u8> {
    if count == 0 {
        status(REPL_ERR_NOT_FOUND)
    } else {
        number(count as i64)
    }
}

/// In-memory Gibson server on an ephemeral TCP port.
pub struct MockServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(Mutex::new(Store::default()));

        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let store = store.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    while let Ok(Some(req)) = read_command(&mut reader).await {
                        let reply = store.lock().handle(&req);
                        match reply {
                            Some(reply) => {
                                if writer.write_all(&reply).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                });
            }
        });

        MockServer { addr, accepted }
    }

    pub fn address(&self) -> Address {
        Address::tcp(self.addr.ip().to_string(), self.addr.port())
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}
