//! # Gibson Binary Codec
//!
//! Purpose: Encode commands into length-prefixed frames and decode reply
//! frames from a byte stream, without touching any I/O.
//!
//! ## Design Principles
//! 1. **Resumable Decoding**: `Decoder` keeps partial frames across calls and
//!    never drops unconsumed bytes; one call yields at most one reply.
//! 2. **Validate Before Send**: Every argument is rendered before the frame
//!    is returned, so a bad argument never produces partial output.
//! 3. **Cursor Parsing**: KVAL payloads are walked with a bounds-checked
//!    cursor, never recursively.
//! 4. **Fail Fast**: Unknown codes and malformed payloads are fatal
//!    `GibsonError::Protocol` errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GibsonError, GibsonResult};
use crate::protocol::{
    Command, Encoding, FrameHeader, ReplyCode, COMMAND_PREFIX_SIZE, ENCODING_SIZE, HEADER_SIZE,
    LENGTH_SIZE, NUMBER_SIZE, OP_CODE_SIZE,
};
use crate::types::{Arg, Reply, ReplyError, Value};

/// Encodes a command and its arguments into one wire frame.
///
/// Arguments are joined with a single space.
///
/// # Errors
/// `InvalidArgument` for null or non-finite arguments, or a query longer
/// than the u32 length prefix can describe.
///
/// # Examples
/// ```rust
/// use gibson_common::{encode_command, Arg, Command};
///
/// let frame = encode_command(Command::Set, &[Arg::from(3600), "foo".into(), 3.14.into()]).unwrap();
/// assert_eq!(&frame[..], b"\x0f\x00\x00\x00\x01\x003600 foo 3.14");
/// ```
pub fn encode_command(command: Command, args: &[Arg<'_>]) -> GibsonResult<Bytes> {
    let mut out = BytesMut::with_capacity(COMMAND_PREFIX_SIZE + OP_CODE_SIZE + 32);
    // Length is patched in once the query size is known.
    out.put_u32_le(0);
    out.put_u16_le(command.op_code());
    for (idx, arg) in args.iter().enumerate() {
        if idx > 0 {
            out.put_u8(b' ');
        }
        arg.write_to(&mut out)?;
    }

    let total = out.len() - COMMAND_PREFIX_SIZE;
    let total = u32::try_from(total).map_err(|_| {
        GibsonError::InvalidArgument(format!("query too large: {total} bytes"))
    })?;
    out[..COMMAND_PREFIX_SIZE].copy_from_slice(&total.to_le_bytes());
    Ok(out.freeze())
}

/// Encodes a command looked up by name.
///
/// # Errors
/// `UnknownCommand` when the name is not in the table, otherwise as
/// [`encode_command`].
pub fn encode_named(name: impl AsRef<[u8]>, args: &[Arg<'_>]) -> GibsonResult<Bytes> {
    encode_command(Command::from_name(name)?, args)
}

/// Incremental reply decoder.
///
/// Feed raw chunks with [`Decoder::feed`] and drain replies with
/// [`Decoder::decode`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,
    header: Option<FrameHeader>,
}

impl Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Decoder::default()
    }

    /// Creates a decoder with a pre-sized buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Decoder {
            buffer: BytesMut::with_capacity(capacity),
            header: None,
        }
    }

    /// Appends a raw chunk read from the stream.
    pub fn feed(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Exposes the buffer so readers can fill it in place.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is pending.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.header.is_none()
    }

    /// Decodes the next complete reply.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Leftover bytes after a
    /// complete frame stay buffered for the next call.
    ///
    /// # Errors
    /// `GibsonError::Protocol` on stream corruption; the decoder should be
    /// discarded afterwards.
    pub fn decode(&mut self) -> GibsonResult<Option<Reply>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_SIZE];
                raw.copy_from_slice(&self.buffer[..HEADER_SIZE]);
                self.buffer.advance(HEADER_SIZE);
                let header = FrameHeader::parse(&raw);
                // Reject before waiting on a payload size read from a bad header.
                if ReplyCode::from_u16(header.reply_code).is_none() {
                    return Err(GibsonError::protocol(format!(
                        "unknown reply code 0x{:04x}",
                        header.reply_code
                    )));
                }
                self.header = Some(header);
                header
            }
        };

        let payload_size = header.payload_size as usize;
        if self.buffer.len() < payload_size {
            return Ok(None);
        }

        let payload = self.buffer.split_to(payload_size).freeze();
        self.header = None;
        tracing::trace!(
            reply_code = header.reply_code,
            encoding = header.encoding,
            payload_size,
            "decoded frame"
        );
        parse_reply(&header, payload).map(Some)
    }
}

fn parse_reply(header: &FrameHeader, payload: Bytes) -> GibsonResult<Reply> {
    let code = ReplyCode::from_u16(header.reply_code).ok_or_else(|| {
        GibsonError::protocol(format!("unknown reply code 0x{:04x}", header.reply_code))
    })?;

    let reply = match code {
        ReplyCode::Err => Reply::Error(ReplyError::Server),
        ReplyCode::ErrNotFound => Reply::Nil,
        ReplyCode::ErrNan => Reply::Error(ReplyError::ExpectedNumber),
        ReplyCode::ErrMem => Reply::Error(ReplyError::MemoryLimit),
        ReplyCode::ErrLocked => Reply::Error(ReplyError::KeyLocked),
        ReplyCode::Ok => Reply::Ok,
        ReplyCode::Val => Reply::Value(parse_value(header.encoding, payload)?),
        ReplyCode::KVal => Reply::Pairs(parse_pairs(payload)?),
    };
    Ok(reply)
}

fn parse_value(encoding: u8, data: Bytes) -> GibsonResult<Value> {
    match Encoding::from_u8(encoding) {
        Some(Encoding::Plain) => Ok(Value::Bytes(data)),
        Some(Encoding::Number) => {
            let raw = <[u8; NUMBER_SIZE]>::try_from(&data[..]).map_err(|_| {
                GibsonError::protocol(format!(
                    "number value must be {NUMBER_SIZE} bytes, got {}",
                    data.len()
                ))
            })?;
            Ok(Value::Int(i64::from_le_bytes(raw)))
        }
        Some(Encoding::Lzf) => Err(GibsonError::protocol("lzf encoding is not valid in replies")),
        None => Err(GibsonError::protocol(format!("unknown value encoding 0x{encoding:02x}"))),
    }
}

fn parse_pairs(mut payload: Bytes) -> GibsonResult<Vec<(Bytes, Value)>> {
    let count = take_u32(&mut payload, "pair count")? as usize;
    // Each pair needs at least 9 bytes; cap the pre-allocation by what is present.
    let min_pair = LENGTH_SIZE + ENCODING_SIZE + LENGTH_SIZE;
    let mut pairs = Vec::with_capacity(count.min(payload.len() / min_pair));

    for _ in 0..count {
        let key_len = take_u32(&mut payload, "key length")? as usize;
        let key = take_bytes(&mut payload, key_len, "key")?;
        if payload.remaining() < ENCODING_SIZE {
            return Err(GibsonError::protocol("truncated kval: value encoding"));
        }
        let encoding = payload.get_u8();
        let value_len = take_u32(&mut payload, "value length")? as usize;
        let value = take_bytes(&mut payload, value_len, "value")?;
        pairs.push((key, parse_value(encoding, value)?));
    }

    if payload.has_remaining() {
        return Err(GibsonError::protocol(format!(
            "kval has {} trailing bytes",
            payload.remaining()
        )));
    }
    Ok(pairs)
}

fn take_u32(payload: &mut Bytes, field: &str) -> GibsonResult<u32> {
    if payload.remaining() < LENGTH_SIZE {
        return Err(GibsonError::protocol(format!("truncated kval: {field}")));
    }
    Ok(payload.get_u32_le())
}

fn take_bytes(payload: &mut Bytes, len: usize, field: &str) -> GibsonResult<Bytes> {
    if payload.remaining() < len {
        return Err(GibsonError::protocol(format!(
            "truncated kval: {field} needs {len} bytes, {} left",
            payload.remaining()
        )));
    }
    Ok(payload.split_to(len))
}
