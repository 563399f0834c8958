//! # Argument and Reply Types
//!
//! Purpose: Model what goes into a command query and what comes back out of
//! a decoded reply frame.
//!
//! ## Design Principles
//!
//! 1. **Borrow-Friendly Arguments**: `Arg` borrows byte and text arguments so
//!    building a query copies each argument exactly once, into the frame.
//! 2. **Closed Reply Union**: A decoded frame is always one `Reply` variant;
//!    server-side failures are data (`Reply::Error`) until a caller asks for
//!    a `Result`.
//! 3. **Zero-Copy Values**: Plain values are `Bytes` slices of the frame.
//! 4. **Null Is Explicit**: `Option::None` maps to `Arg::Null`, which the
//!    encoder rejects before anything is written.

use std::fmt::{self, Write as _};

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::error::{GibsonError, GibsonResult};

/// One query argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    /// Raw bytes, passed through unchanged.
    Bytes(&'a [u8]),
    /// Text, encoded as UTF-8.
    Text(&'a str),
    /// Signed integer, rendered as decimal text.
    Int(i64),
    /// Unsigned integer, rendered as decimal text.
    UInt(u64),
    /// Float, rendered as shortest round-trip decimal text.
    Float(f64),
    /// Missing value; never encodable.
    Null,
}

impl Arg<'_> {
    /// Appends the argument's byte form to `out`.
    ///
    /// # Errors
    /// `InvalidArgument` for `Null` and for non-finite floats.
    pub fn write_to(&self, out: &mut BytesMut) -> GibsonResult<()> {
        match *self {
            Arg::Bytes(data) => out.put_slice(data),
            Arg::Text(text) => out.put_slice(text.as_bytes()),
            Arg::Int(value) => write_display(out, value),
            Arg::UInt(value) => write_display(out, value),
            Arg::Float(value) => {
                if !value.is_finite() {
                    return Err(GibsonError::InvalidArgument(format!(
                        "float argument must be finite, got {value}"
                    )));
                }
                // Debug keeps a trailing ".0" on integral values (1.0, not 1).
                let _ = write!(out, "{value:?}");
            }
            Arg::Null => {
                return Err(GibsonError::InvalidArgument("null argument".to_string()));
            }
        }
        Ok(())
    }
}

fn write_display(out: &mut BytesMut, value: impl fmt::Display) {
    // BytesMut grows on demand, so fmt::Write never fails here.
    let _ = write!(out, "{value}");
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Arg<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a Vec<u8>> for Arg<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a Bytes> for Arg<'a> {
    fn from(value: &'a Bytes) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Text(value)
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(value: &'a String) -> Self {
        Arg::Text(value)
    }
}

macro_rules! arg_from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg<'_> {
            fn from(value: $ty) -> Self {
                Arg::Int(value as i64)
            }
        })*
    };
}

macro_rules! arg_from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg<'_> {
            fn from(value: $ty) -> Self {
                Arg::UInt(value as u64)
            }
        })*
    };
}

arg_from_signed!(i8, i16, i32, i64, isize);
arg_from_unsigned!(u8, u16, u32, u64, usize);

impl From<f32> for Arg<'_> {
    fn from(value: f32) -> Self {
        Arg::Float(value as f64)
    }
}

impl From<f64> for Arg<'_> {
    fn from(value: f64) -> Self {
        Arg::Float(value)
    }
}

impl<'a, T> From<Option<T>> for Arg<'a>
where
    T: Into<Arg<'a>>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Null, Into::into)
    }
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `PLAIN` payload.
    Bytes(Bytes),
    /// `NUMBER` payload.
    Int(i64),
    /// `PLAIN` payload decoded with a charset.
    Text(String),
}

impl Value {
    /// Returns the raw bytes of a byte or text value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(data) => Some(data),
            Value::Text(text) => Some(text.as_bytes()),
            Value::Int(_) => None,
        }
    }

    /// Returns the integer of a `NUMBER` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the text of a charset-decoded value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Value::Bytes(data) => !data.is_empty(),
            Value::Int(value) => *value != 0,
            Value::Text(text) => !text.is_empty(),
        }
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

/// Server-side failure carried by a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    Server,
    ExpectedNumber,
    MemoryLimit,
    KeyLocked,
}

impl From<ReplyError> for GibsonError {
    fn from(kind: ReplyError) -> Self {
        match kind {
            ReplyError::Server => GibsonError::Server,
            ReplyError::ExpectedNumber => GibsonError::ExpectedNumber,
            ReplyError::MemoryLimit => GibsonError::MemoryLimit,
            ReplyError::KeyLocked => GibsonError::KeyLocked,
        }
    }
}

/// One decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Server error reply.
    Error(ReplyError),
    /// `OK`.
    Ok,
    /// `ERR_NOT_FOUND`: a miss.
    Nil,
    /// `VAL`.
    Value(Value),
    /// `KVAL`, in wire order.
    Pairs(Vec<(Bytes, Value)>),
}

impl Reply {
    /// Turns an error reply into `Err`, passing every other variant through.
    pub fn into_result(self) -> GibsonResult<Reply> {
        match self {
            Reply::Error(kind) => Err(kind.into()),
            other => Ok(other),
        }
    }

    /// Boolean coercion: `Ok` and non-empty/non-zero values are true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Reply::Error(_) | Reply::Nil => false,
            Reply::Ok => true,
            Reply::Value(value) => value.is_truthy(),
            Reply::Pairs(pairs) => !pairs.is_empty(),
        }
    }

    /// Returns the single value, `None` on a miss.
    pub fn into_value(self) -> GibsonResult<Option<Value>> {
        match self.into_result()? {
            Reply::Value(value) => Ok(Some(value)),
            Reply::Nil => Ok(None),
            _ => Err(GibsonError::UnexpectedReply),
        }
    }

    /// Returns the integer of a `NUMBER` value reply.
    pub fn into_int(self) -> GibsonResult<i64> {
        match self.into_result()? {
            Reply::Value(Value::Int(value)) => Ok(value),
            _ => Err(GibsonError::UnexpectedReply),
        }
    }

    /// Returns key/value pairs; a miss is an empty list.
    pub fn into_pairs(self) -> GibsonResult<Vec<(Bytes, Value)>> {
        match self.into_result()? {
            Reply::Pairs(pairs) => Ok(pairs),
            Reply::Nil => Ok(Vec::new()),
            _ => Err(GibsonError::UnexpectedReply),
        }
    }

    /// Flattens a pairs reply into `key, value, key, value, ...`.
    pub fn into_flat(self) -> GibsonResult<Vec<Value>> {
        let pairs = self.into_pairs()?;
        let mut flat = Vec::with_capacity(pairs.len() * 2);
        for (key, value) in pairs {
            flat.push(Value::Bytes(key));
            flat.push(value);
        }
        Ok(flat)
    }
}

/// Charset used to turn plain reply bytes into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    #[serde(alias = "utf-8")]
    Utf8,
    #[serde(alias = "us-ascii")]
    Ascii,
    #[serde(alias = "iso-8859-1")]
    Latin1,
}

impl Charset {
    /// Decodes `data` into a `String`.
    ///
    /// # Errors
    /// `GibsonError::Decode` when the bytes are not valid in this charset.
    pub fn decode(self, data: &[u8]) -> GibsonResult<String> {
        match self {
            Charset::Utf8 => std::str::from_utf8(data)
                .map(str::to_owned)
                .map_err(|err| GibsonError::Decode(format!("utf-8: {err}"))),
            Charset::Ascii => match data.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(GibsonError::Decode(format!(
                    "ascii: byte 0x{:02x} at offset {pos}",
                    data[pos]
                ))),
                None => Ok(data.iter().map(|&b| b as char).collect()),
            },
            Charset::Latin1 => Ok(data.iter().map(|&b| b as char).collect()),
        }
    }

    /// Applies the charset to a single plain value; other replies pass through.
    pub fn decode_reply(self, reply: Reply) -> GibsonResult<Reply> {
        match reply {
            Reply::Value(Value::Bytes(data)) => Ok(Reply::Value(Value::Text(self.decode(&data)?))),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(arg: Arg<'_>) -> GibsonResult<Vec<u8>> {
        let mut out = BytesMut::new();
        arg.write_to(&mut out)?;
        Ok(out.to_vec())
    }

    #[test]
    fn test_arg_rendering() {
        assert_eq!(render(Arg::from(&b"raw"[..])).unwrap(), b"raw");
        assert_eq!(render(Arg::from("héllo")).unwrap(), "héllo".as_bytes());
        assert_eq!(render(Arg::from(3600)).unwrap(), b"3600");
        assert_eq!(render(Arg::from(-7i64)).unwrap(), b"-7");
        assert_eq!(render(Arg::from(u64::MAX)).unwrap(), b"18446744073709551615");
        assert_eq!(render(Arg::from(3.14)).unwrap(), b"3.14");
        assert_eq!(render(Arg::from(1.0)).unwrap(), b"1.0");
    }

    #[test]
    fn test_arg_null_rejected() {
        let missing: Option<&str> = None;
        assert!(matches!(render(Arg::from(missing)), Err(GibsonError::InvalidArgument(_))));
        assert_eq!(render(Arg::from(Some("x"))).unwrap(), b"x");
    }

    #[test]
    fn test_arg_non_finite_rejected() {
        assert!(matches!(render(Arg::from(f64::NAN)), Err(GibsonError::InvalidArgument(_))));
        assert!(matches!(render(Arg::from(f64::INFINITY)), Err(GibsonError::InvalidArgument(_))));
    }

    #[test]
    fn test_reply_truthiness() {
        assert!(Reply::Ok.is_truthy());
        assert!(!Reply::Nil.is_truthy());
        assert!(Reply::Value(Value::Int(1)).is_truthy());
        assert!(!Reply::Value(Value::Int(0)).is_truthy());
        assert!(!Reply::Error(ReplyError::KeyLocked).is_truthy());
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Nil.into_value().unwrap(), None);
        assert_eq!(Reply::Value(Value::Int(9)).into_int().unwrap(), 9);
        assert!(matches!(
            Reply::Error(ReplyError::MemoryLimit).into_value(),
            Err(GibsonError::MemoryLimit)
        ));
        assert!(matches!(Reply::Ok.into_int(), Err(GibsonError::UnexpectedReply)));
        assert!(Reply::Nil.into_pairs().unwrap().is_empty());
    }

    #[test]
    fn test_charset_decode() {
        assert_eq!(Charset::Utf8.decode("né".as_bytes()).unwrap(), "né");
        assert!(matches!(Charset::Utf8.decode(b"\xff"), Err(GibsonError::Decode(_))));
        assert!(matches!(Charset::Ascii.decode(b"a\x80"), Err(GibsonError::Decode(_))));
        assert_eq!(Charset::Latin1.decode(b"caf\xe9").unwrap(), "café");
    }

    #[test]
    fn test_charset_leaves_numbers() {
        let reply = Charset::Utf8.decode_reply(Reply::Value(Value::Int(3))).unwrap();
        assert_eq!(reply, Reply::Value(Value::Int(3)));
        let reply = Charset::Utf8
            .decode_reply(Reply::Value(Value::Bytes(Bytes::from_static(b"bar"))))
            .unwrap();
        assert_eq!(reply, Reply::Value(Value::Text("bar".to_string())));
    }
}
