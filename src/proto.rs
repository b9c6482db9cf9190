//! Module implement the selva_proto value model and frame codec.
//!
//! The outer server speaks a length-framed request/response protocol.
//! Each frame carries a [FrameHeader] and a payload that is a sequence
//! of typed values. The command surface consumes decoded values and
//! produces values for the reply; the socket handling itself lives
//! outside the core.

use std::{convert::TryInto, fmt};

use crate::{sstring, Error, Result};

macro_rules! check_remaining {
    ($buf:expr, $want:expr, $msg:expr) => {
        if $buf.len() < $want {
            err_at!(
                OutOfBuffer, msg: "insufficient input {} {}/{}", $msg, $buf.len(), $want
            )
        } else {
            Ok(())
        }
    };
}

/// Frame flags.
pub const FRAME_FFIRST: u8 = 0x01;
pub const FRAME_FLAST: u8 = 0x02;
/// Long lived stream; the server heartbeat stream writes [HEARTBEAT]
/// every 5 seconds.
pub const FRAME_FSTREAM: u8 = 0x04;
pub const FRAME_FDEFLATE: u8 = 0x08;

/// Payload of the server initiated heartbeat stream.
pub const HEARTBEAT: &[u8] = b"boum";

/// String value flags.
pub const STRING_FDEFLATE: u8 = 0x01;

/// Frame header of the wire protocol.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct FrameHeader {
    pub cmd: u8,
    pub flags: u8,
    pub seqno: u32,
    pub frame_bsize: u16,
    /// Total message size when known on the first frame, otherwise 0.
    pub msg_bsize: u32,
    /// Command timestamp, milliseconds since the epoch.
    pub cmd_timestamp: i64,
}

impl FrameHeader {
    pub const SIZE: usize = 20;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.cmd);
        buf.push(self.flags);
        buf.extend_from_slice(&self.seqno.to_le_bytes());
        buf.extend_from_slice(&self.frame_bsize.to_le_bytes());
        buf.extend_from_slice(&self.msg_bsize.to_le_bytes());
        buf.extend_from_slice(&self.cmd_timestamp.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<FrameHeader> {
        check_remaining!(buf, FrameHeader::SIZE, "frame header")?;
        Ok(FrameHeader {
            cmd: buf[0],
            flags: buf[1],
            seqno: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            frame_bsize: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            msg_bsize: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            cmd_timestamp: i64::from_le_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

// Wire type tags.
const TAG_NULL: u8 = 0;
const TAG_ERROR: u8 = 1;
const TAG_DOUBLE: u8 = 2;
const TAG_LONGLONG: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_ARRAY_END: u8 = 6;
const TAG_END: u8 = 7;

// Embedded arrays with a postponed length use this sentinel and close
// with an array-end tag.
const LEN_POSTPONED: u32 = u32::MAX;

/// A typed payload value.
#[derive(Clone, PartialEq)]
pub enum Value {
    Null,
    Error { code: i32, message: Option<String> },
    Double(f64),
    LongLong(i64),
    String { flags: u8, data: Vec<u8> },
    Array(Vec<Value>),
    /// End-of-sequence marker.
    End,
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::String { flags: 0, data: s.as_bytes().to_vec() }
    }

    pub fn bytes(data: &[u8]) -> Value {
        Value::String { flags: 0, data: data.to_vec() }
    }

    /// A deflate compressed string value.
    pub fn deflated(data: &[u8]) -> Result<Value> {
        Ok(Value::String { flags: STRING_FDEFLATE, data: sstring::deflate(data)? })
    }

    pub fn from_err(err: &Error) -> Value {
        Value::Error { code: err.to_code(), message: Some(err.to_string()) }
    }

    /// Raw bytes of a string value, inflating deflated payloads.
    pub fn to_data(&self) -> Result<Vec<u8>> {
        match self {
            Value::String { flags, data } if (flags & STRING_FDEFLATE) != 0 => {
                sstring::inflate_raw(data)
            }
            Value::String { data, .. } => Ok(data.clone()),
            v => err_at!(TypeMismatch, msg: "string value expected, got {:?}", v),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String { flags, data } if (flags & STRING_FDEFLATE) == 0 => {
                err_at!(TypeMismatch, std::str::from_utf8(data))
            }
            v => err_at!(TypeMismatch, msg: "string value expected, got {:?}", v),
        }
    }

    pub fn to_long_long(&self) -> Result<i64> {
        match self {
            Value::LongLong(v) => Ok(*v),
            Value::String { .. } => {
                let s = self.as_str()?;
                err_at!(RangeError, s.parse::<i64>(), "{:?}", s)
            }
            v => err_at!(TypeMismatch, msg: "integer value expected, got {:?}", v),
        }
    }

    pub fn to_double(&self) -> Result<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            Value::LongLong(v) => Ok(*v as f64),
            Value::String { .. } => {
                let s = self.as_str()?;
                err_at!(RangeError, s.parse::<f64>(), "{:?}", s)
            }
            v => err_at!(TypeMismatch, msg: "double value expected, got {:?}", v),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(TAG_NULL),
            Value::Error { code, message } => {
                buf.push(TAG_ERROR);
                buf.extend_from_slice(&code.to_le_bytes());
                let msg = message.as_deref().unwrap_or("");
                buf.extend_from_slice(&(msg.len() as u16).to_le_bytes());
                buf.extend_from_slice(msg.as_bytes());
            }
            Value::Double(v) => {
                buf.push(TAG_DOUBLE);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::LongLong(v) => {
                buf.push(TAG_LONGLONG);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::String { flags, data } => {
                buf.push(TAG_STRING);
                buf.push(*flags);
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
            }
            Value::Array(values) => {
                buf.push(TAG_ARRAY);
                buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
                for v in values {
                    v.encode(buf);
                }
            }
            Value::End => buf.push(TAG_END),
        }
    }

    fn decode_one(buf: &[u8]) -> Result<(Value, usize)> {
        check_remaining!(buf, 1, "value tag")?;
        match buf[0] {
            TAG_NULL => Ok((Value::Null, 1)),
            TAG_ERROR => {
                check_remaining!(buf, 7, "error value")?;
                let code = i32::from_le_bytes(buf[1..5].try_into().unwrap());
                let len = u16::from_le_bytes(buf[5..7].try_into().unwrap()) as usize;
                check_remaining!(buf, 7 + len, "error message")?;
                let message = if len == 0 {
                    None
                } else {
                    Some(
                        err_at!(TypeMismatch, std::str::from_utf8(&buf[7..7 + len]))?
                            .to_string(),
                    )
                };
                Ok((Value::Error { code, message }, 7 + len))
            }
            TAG_DOUBLE => {
                check_remaining!(buf, 9, "double value")?;
                let v = f64::from_le_bytes(buf[1..9].try_into().unwrap());
                Ok((Value::Double(v), 9))
            }
            TAG_LONGLONG => {
                check_remaining!(buf, 9, "long long value")?;
                let v = i64::from_le_bytes(buf[1..9].try_into().unwrap());
                Ok((Value::LongLong(v), 9))
            }
            TAG_STRING => {
                check_remaining!(buf, 6, "string value")?;
                let flags = buf[1];
                let len = u32::from_le_bytes(buf[2..6].try_into().unwrap()) as usize;
                check_remaining!(buf, 6 + len, "string payload")?;
                Ok((Value::String { flags, data: buf[6..6 + len].to_vec() }, 6 + len))
            }
            TAG_ARRAY => {
                check_remaining!(buf, 5, "array value")?;
                let len = u32::from_le_bytes(buf[1..5].try_into().unwrap());
                let mut off = 5;
                let mut values = vec![];
                if len == LEN_POSTPONED {
                    loop {
                        check_remaining!(&buf[off..], 1, "array element")?;
                        if buf[off] == TAG_ARRAY_END {
                            off += 1;
                            break;
                        }
                        let (v, n) = Value::decode_one(&buf[off..])?;
                        values.push(v);
                        off += n;
                    }
                } else {
                    for _ in 0..len {
                        let (v, n) = Value::decode_one(&buf[off..])?;
                        values.push(v);
                        off += n;
                    }
                }
                Ok((Value::Array(values), off))
            }
            TAG_ARRAY_END => err_at!(InvalidInput, msg: "stray array end"),
            TAG_END => Ok((Value::End, 1)),
            tag => err_at!(InvalidInput, msg: "value tag {}", tag),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Error { code, message } => write!(f, "error({}, {:?})", code, message),
            Value::Double(v) => write!(f, "{:?}", v),
            Value::LongLong(v) => write!(f, "{}", v),
            Value::String { data, .. } => write!(f, "{:?}", String::from_utf8_lossy(data)),
            Value::Array(values) => write!(f, "{:?}", values),
            Value::End => write!(f, "end"),
        }
    }
}

/// Encode a value sequence into payload bytes.
pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut buf = vec![];
    for v in values {
        v.encode(&mut buf);
    }
    buf
}

/// Decode a whole payload into its value sequence.
pub fn decode_values(mut buf: &[u8]) -> Result<Vec<Value>> {
    let mut values = vec![];
    while !buf.is_empty() {
        let (v, n) = Value::decode_one(buf)?;
        values.push(v);
        buf = &buf[n..];
    }
    Ok(values)
}

#[cfg(test)]
#[path = "proto_test.rs"]
mod proto_test;
