//! A minimal RESP2 value type, encoder, and frame decoder.
//!
//! This stands in for the external wire codec named in the core's
//! collaborator list (§6 of the spec this crate implements): the session
//! only depends on [`Value`] and [`ValueCodec`], never on how a real
//! production codec frames bytes, so swapping this module out for one is a
//! drop-in change.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{Error, ErrorKind};

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    /// A RESP simple string (`+OK\r\n`), used for status replies like `PONG`/`OK`.
    Status(String),
    /// A RESP bulk string (`$<len>\r\n...\r\n`).
    Bulk(Vec<u8>),
    Array(Vec<Value>),
    /// A RESP error reply (`-ERR ...\r\n`). Kept distinct from a transport
    /// [`Error`] because an error *reply* is still a successful round trip.
    Error(String),
}

impl Value {
    pub fn as_status(&self) -> Option<&str> {
        match self {
            Value::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&str> {
        match self {
            Value::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// An argument to a [`Request`].
#[derive(Debug, Clone)]
pub enum Arg {
    Bytes(Vec<u8>),
    Int(i64),
    Str(String),
    /// Never produced by the public `ToArg` conversions; exists only so
    /// tests can synthesize an encoding failure for scenario coverage
    /// (§8, scenario 6) without reaching into encoder internals.
    #[doc(hidden)]
    Invalid,
}

/// Converts a caller-supplied value into a wire [`Arg`]. Implemented for
/// the primitive and byte-slice types the spec's data model allows;
/// anything else is a compile error rather than a runtime one, since Rust's
/// generics let admission be checked at the call site.
pub trait ToArg {
    fn to_arg(&self) -> Arg;
}

impl ToArg for &str {
    fn to_arg(&self) -> Arg {
        Arg::Str((*self).to_owned())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Arg {
        Arg::Str(self.clone())
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Arg {
        Arg::Bytes((*self).to_vec())
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Arg {
        Arg::Bytes(self.clone())
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> Arg {
                Arg::Int(*self as i64)
            }
        })*
    };
}
int_to_arg!(i8, i16, i32, i64, u8, u16, u32, usize);

/// A command plus its already-converted arguments, ready for wire
/// encoding.
#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: &'static str,
    pub args: Vec<Arg>,
}

impl Request {
    pub fn new(cmd: &'static str) -> Self {
        Request {
            cmd,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, a: impl ToArg) -> Self {
        self.args.push(a.to_arg());
        self
    }

    /// Appends this request's RESP array-of-bulk-strings encoding to `buf`.
    /// On an unsupported argument, returns [`ErrorKind::ArgumentType`]
    /// without partially writing: the caller is responsible for truncating
    /// `buf` back to its length-on-entry on error, which is what lets the
    /// shard's "append under lock, roll back on failure" admission rule
    /// (§4.A step 4) hold without a pre-encode scratch copy.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let start = buf.len();
        buf.extend_from_slice(format!("*{}\r\n", self.args.len() + 1).as_bytes());
        write_bulk(buf, self.cmd.as_bytes());
        for a in &self.args {
            match a {
                Arg::Bytes(b) => write_bulk(buf, b),
                Arg::Str(s) => write_bulk(buf, s.as_bytes()),
                Arg::Int(i) => write_bulk(buf, i.to_string().as_bytes()),
                Arg::Invalid => {
                    buf.truncate(start);
                    return Err(Error::new(ErrorKind::ArgumentType));
                }
            }
        }
        Ok(())
    }
}

fn write_bulk(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(b"\r\n");
}

/// Finds the index just past the next `\r\n` in `buf`, starting at `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Attempts to parse one [`Value`] starting at the front of `buf`.
///
/// Returns `Ok(None)` when `buf` doesn't yet hold a complete value (the
/// caller should wait for more bytes), `Ok(Some((value, consumed)))` on a
/// complete parse, or `Err` on malformed input. Re-parses from the start
/// of the buffer on every call rather than threading partial-parse state
/// through `Decoder`, trading a little redundant work for a much simpler
/// state machine — acceptable here because a RESP frame is never
/// multi-megabyte.
fn parse_value(buf: &[u8]) -> Result<Option<(Value, usize)>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }
    let tag = buf[0];
    let Some(line_end) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let line = &buf[1..line_end];
    let after_line = line_end + 2;

    match tag {
        b'+' => {
            let s = std::str::from_utf8(line)
                .map_err(|e| Error::with_cause(ErrorKind::Response, e))?
                .to_owned();
            Ok(Some((Value::Status(s), after_line)))
        }
        b'-' => {
            let s = std::str::from_utf8(line)
                .map_err(|e| Error::with_cause(ErrorKind::Response, e))?
                .to_owned();
            Ok(Some((Value::Error(s), after_line)))
        }
        b':' => {
            let n = parse_i64(line)?;
            Ok(Some((Value::Int(n), after_line)))
        }
        b'$' => {
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, after_line)));
            }
            let len = len as usize;
            let body_end = after_line + len;
            if buf.len() < body_end + 2 {
                return Ok(None);
            }
            let bytes = buf[after_line..body_end].to_vec();
            Ok(Some((Value::Bulk(bytes), body_end + 2)))
        }
        b'*' => {
            let count = parse_i64(line)?;
            if count < 0 {
                return Ok(Some((Value::Nil, after_line)));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut pos = after_line;
            for _ in 0..count {
                match parse_value(&buf[pos..])? {
                    Some((v, consumed)) => {
                        items.push(v);
                        pos += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), pos)))
        }
        other => Err(Error::with_message(
            ErrorKind::Response,
            format!("unexpected RESP type byte {other:#x}"),
        )),
    }
}

fn parse_i64(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::with_message(ErrorKind::Response, "expected integer"))
}

/// Frames one [`Value`] at a time out of a byte stream.
#[derive(Default)]
pub struct ValueCodec {
    _private: (),
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Error> {
        match parse_value(src)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
