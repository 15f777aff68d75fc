use crate::buffer::WriteBuffer;
use crate::errors::{Error, Result};
use bytes::{Bytes, BytesMut};
use nom::branch::alt;
use nom::bytes::streaming::{take, take_until};
use nom::character::streaming::{char, crlf, digit1};
use nom::combinator::{map, map_res, opt};
use nom::multi::count;
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;

const CRLF: &[u8] = b"\r\n";

/// A decoded RESP reply. Nil bulk strings and nil arrays are kept
/// distinct from their empty counterparts.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Reply {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// True for the `+OK` status reply.
    pub fn is_ok_status(&self) -> bool {
        matches!(self, Reply::SimpleString(s) if &s[..] == b"OK")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Payload bytes for bulk/simple strings, `None` otherwise.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::SimpleString(b) => Some(b),
            Reply::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// One command argument. The enum is the whole argument-type contract:
/// anything else simply cannot reach the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Text(String),
    Blob(Bytes),
    Int(i64),
    /// Pre-formatted payload whose segments are spliced into the
    /// surrounding write buffer without copy.
    Buffer(WriteBuffer),
}

impl From<&str> for Argument {
    fn from(s: &str) -> Argument {
        Argument::Text(s.to_owned())
    }
}

impl From<String> for Argument {
    fn from(s: String) -> Argument {
        Argument::Text(s)
    }
}

impl From<&[u8]> for Argument {
    fn from(b: &[u8]) -> Argument {
        Argument::Blob(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Argument {
    fn from(b: Vec<u8>) -> Argument {
        Argument::Blob(Bytes::from(b))
    }
}

impl From<Bytes> for Argument {
    fn from(b: Bytes) -> Argument {
        Argument::Blob(b)
    }
}

impl From<i64> for Argument {
    fn from(i: i64) -> Argument {
        Argument::Int(i)
    }
}

impl From<u64> for Argument {
    fn from(i: u64) -> Argument {
        Argument::Int(i as i64)
    }
}

impl From<usize> for Argument {
    fn from(i: usize) -> Argument {
        Argument::Int(i as i64)
    }
}

impl From<WriteBuffer> for Argument {
    fn from(b: WriteBuffer) -> Argument {
        Argument::Buffer(b)
    }
}

fn append_bulk_header(buf: &mut WriteBuffer, len: usize) {
    buf.append(format!("${}\r\n", len).into_bytes());
}

/// Formats a full command as a RESP array of bulk strings.
///
/// Text arguments are UTF-8 encoded, integers are rendered in decimal,
/// blobs and buffer references are transmitted as-is (the latter by
/// moving their segments, without copy).
pub fn format_command(args: Vec<Argument>) -> Result<WriteBuffer> {
    if args.is_empty() {
        return Err(Error::client("empty command"));
    }
    let mut buf = WriteBuffer::new();
    buf.append(format!("*{}\r\n", args.len()).into_bytes());
    for arg in args {
        match arg {
            Argument::Text(s) => {
                let raw = Bytes::from(s.into_bytes());
                append_bulk_header(&mut buf, raw.len());
                buf.append(raw);
                buf.append(CRLF);
            }
            Argument::Blob(raw) => {
                append_bulk_header(&mut buf, raw.len());
                buf.append(raw);
                buf.append(CRLF);
            }
            Argument::Int(i) => {
                let raw = Bytes::from(i.to_string().into_bytes());
                append_bulk_header(&mut buf, raw.len());
                buf.append(raw);
                buf.append(CRLF);
            }
            Argument::Buffer(inner) => {
                append_bulk_header(&mut buf, inner.len());
                buf.append_buffer(inner);
                buf.append(CRLF);
            }
        }
    }
    Ok(buf)
}

fn read_positive_decimal(bytes: &[u8]) -> IResult<&[u8], u64> {
    map_res(digit1, |b: &[u8]| {
        std::str::from_utf8(b)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u64>().map_err(|_| ()))
    })(bytes)
}

fn read_decimal(bytes: &[u8]) -> IResult<&[u8], i64> {
    let (rem, (minus, int)) = tuple((opt(char('-')), read_positive_decimal))(bytes)?;
    Ok((
        rem,
        if minus.is_some() {
            -(int as i64)
        } else {
            int as i64
        },
    ))
}

fn read_simple(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char('+'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| {
        Reply::SimpleString(Bytes::copy_from_slice(s))
    })(bytes)
}

fn read_error(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char('-'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| Reply::Error(Bytes::copy_from_slice(s)))(bytes)
}

fn read_integer(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char(':'), terminated(read_decimal, crlf));
    map(parser, Reply::Integer)(bytes)
}

// negative length means a nil bulk string; zero is a valid empty one
fn read_bulk(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let (rem, size) = preceded(char('$'), terminated(read_decimal, crlf))(bytes)?;
    if size < 0 {
        Ok((rem, Reply::BulkString(None)))
    } else {
        terminated(
            map(take(size as usize), |b: &[u8]| {
                Reply::BulkString(Some(Bytes::copy_from_slice(b)))
            }),
            crlf,
        )(rem)
    }
}

fn read_array(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let (rem, size) = preceded(char('*'), terminated(read_decimal, crlf))(bytes)?;
    if size < 0 {
        Ok((rem, Reply::Array(None)))
    } else {
        map(count(read_reply, size as usize), |v| Reply::Array(Some(v)))(rem)
    }
}

pub fn read_reply(bytes: &[u8]) -> IResult<&[u8], Reply> {
    alt((
        read_integer,
        read_simple,
        read_bulk,
        read_error,
        read_array,
    ))(bytes)
}

/// Incremental RESP reply parser.
///
/// Feed it raw socket chunks; it yields one decoded reply at a time, or
/// `None` while a frame is still incomplete. Unrecognized framing is a
/// fatal protocol error: the caller is expected to drop the connection.
#[derive(Default)]
pub struct ReplyReader {
    buf: BytesMut,
}

impl ReplyReader {
    pub fn new() -> ReplyReader {
        ReplyReader {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn try_read(&mut self) -> Result<Option<Reply>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let size = self.buf.len();
        let (rem_size, reply) = match read_reply(&self.buf) {
            Ok((rem, reply)) => (rem.len(), reply),
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(err) => return Err(Error::protocol(format!("bad reply framing: {}", err))),
        };
        let _ = self.buf.split_to(size - rem_size);
        Ok(Some(reply))
    }
}
