//! # Protocol Tables
//!
//! Purpose: Define the fixed op-code, reply-code, and value-encoding tables
//! shared by the Gibson client and server.
//!
//! ## Design Principles
//!
//! 1. **Closed Enumerations**: Every code is a Rust enum; unknown wire values
//!    never turn into a variant silently.
//! 2. **Little-Endian Wire**: All multi-byte integers are little-endian.
//! 3. **Versioned by Table**: Adding a code means a protocol version bump.
//!
//! ## Memory Layout Example
//!
//! ```text
//! Command frame (6 + len(query) bytes):
//! +--------------+------------+-------------------+
//! | total_len:4B | op_code:2B | query:total_len-2 |
//! +--------------+------------+-------------------+
//!
//! Reply frame (7 + payload_size bytes):
//! +---------------+-------------+-----------------+----------------------+
//! | reply_code:2B | encoding:1B | payload_size:4B | payload:payload_size |
//! +---------------+-------------+-----------------+----------------------+
//!
//! KVAL payload:
//! +----------+--------------------------------------------------------+
//! | count:4B | count x (key_len:4B key enc:1B val_len:4B val)         |
//! +----------+--------------------------------------------------------+
//! ```

use std::fmt;

use crate::error::{GibsonError, GibsonResult};

/// Size of the op-code field in a command frame.
pub const OP_CODE_SIZE: usize = 2;

/// Size of the value-encoding field in a reply header or KVAL entry.
pub const ENCODING_SIZE: usize = 1;

/// Size of every length/count field (u32) in replies.
pub const LENGTH_SIZE: usize = 4;

/// Fixed reply header size: reply code + encoding + payload size.
pub const HEADER_SIZE: usize = OP_CODE_SIZE + ENCODING_SIZE + LENGTH_SIZE;

/// Size of the total-length prefix in a command frame.
pub const COMMAND_PREFIX_SIZE: usize = 4;

/// Packed integer width for `NUMBER` encoded values.
pub const NUMBER_SIZE: usize = 8;

/// Commands understood by the server, with their wire op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Set = 0x01,
    Ttl = 0x02,
    Get = 0x03,
    Del = 0x04,
    Inc = 0x05,
    Dec = 0x06,
    Lock = 0x07,
    Unlock = 0x08,
    MSet = 0x09,
    MTtl = 0x0A,
    MGet = 0x0B,
    MDel = 0x0C,
    MInc = 0x0D,
    MDec = 0x0E,
    MLock = 0x0F,
    MUnlock = 0x10,
    Count = 0x11,
    Stats = 0x12,
    Ping = 0x13,
    Meta = 0x14,
    Keys = 0x15,
    End = 0xFF,
}

impl Command {
    /// Every command in op-code order.
    pub const ALL: [Command; 22] = [
        Command::Set,
        Command::Ttl,
        Command::Get,
        Command::Del,
        Command::Inc,
        Command::Dec,
        Command::Lock,
        Command::Unlock,
        Command::MSet,
        Command::MTtl,
        Command::MGet,
        Command::MDel,
        Command::MInc,
        Command::MDec,
        Command::MLock,
        Command::MUnlock,
        Command::Count,
        Command::Stats,
        Command::Ping,
        Command::Meta,
        Command::Keys,
        Command::End,
    ];

    /// Returns the wire op code.
    #[inline]
    pub const fn op_code(self) -> u16 {
        self as u16
    }

    /// Returns the lowercase token used to name the command.
    pub const fn name(self) -> &'static str {
        match self {
            Command::Set => "set",
            Command::Ttl => "ttl",
            Command::Get => "get",
            Command::Del => "del",
            Command::Inc => "inc",
            Command::Dec => "dec",
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::MSet => "mset",
            Command::MTtl => "mttl",
            Command::MGet => "mget",
            Command::MDel => "mdel",
            Command::MInc => "minc",
            Command::MDec => "mdec",
            Command::MLock => "mlock",
            Command::MUnlock => "munlock",
            Command::Count => "count",
            Command::Stats => "stats",
            Command::Ping => "ping",
            Command::Meta => "meta",
            Command::Keys => "keys",
            Command::End => "end",
        }
    }

    /// Resolves a command token, ignoring surrounding whitespace.
    ///
    /// # Errors
    /// Returns `GibsonError::UnknownCommand` when the token is not in the table.
    pub fn from_name(name: impl AsRef<[u8]>) -> GibsonResult<Self> {
        let token = name.as_ref().trim_ascii();
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.name().as_bytes() == token)
            .ok_or_else(|| GibsonError::UnknownCommand(String::from_utf8_lossy(token).into_owned()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply codes carried in the first two bytes of every reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReplyCode {
    /// Generic server error.
    Err = 0x00,
    /// Key not found; a miss, not a failure.
    ErrNotFound = 0x01,
    /// Expected a numeric argument.
    ErrNan = 0x02,
    /// Server memory limit reached.
    ErrMem = 0x03,
    /// Key is locked.
    ErrLocked = 0x04,
    /// Boolean success.
    Ok = 0x05,
    /// Single value.
    Val = 0x06,
    /// Key/value list.
    KVal = 0x07,
}

impl ReplyCode {
    /// Maps a wire value to a reply code, or `None` when unknown.
    pub const fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x00 => Some(ReplyCode::Err),
            0x01 => Some(ReplyCode::ErrNotFound),
            0x02 => Some(ReplyCode::ErrNan),
            0x03 => Some(ReplyCode::ErrMem),
            0x04 => Some(ReplyCode::ErrLocked),
            0x05 => Some(ReplyCode::Ok),
            0x06 => Some(ReplyCode::Val),
            0x07 => Some(ReplyCode::KVal),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Per-value encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    /// Raw bytes.
    Plain = 0x00,
    /// Compressed data; reserved and never valid in replies.
    Lzf = 0x01,
    /// Packed little-endian i64.
    Number = 0x02,
}

impl Encoding {
    /// Maps a wire value to an encoding, or `None` when unknown.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Encoding::Plain),
            0x01 => Some(Encoding::Lzf),
            0x02 => Some(Encoding::Number),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Parsed reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw reply code; validated only once the payload is complete.
    pub reply_code: u16,
    /// Raw value encoding byte.
    pub encoding: u8,
    /// Exact payload length following the header.
    pub payload_size: u32,
}

impl FrameHeader {
    /// Parses a header from exactly `HEADER_SIZE` bytes.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        FrameHeader {
            reply_code: u16::from_le_bytes([bytes[0], bytes[1]]),
            encoding: bytes[2],
            payload_size: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        }
    }

    /// Serializes the header to wire bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..2].copy_from_slice(&self.reply_code.to_le_bytes());
        out[2] = self.encoding;
        out[3..].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    /// Total frame length including the header.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_size as usize
    }
}
