//! RESP framing for the stub.
//!
//! Requests are always arrays of bulk strings. Responses cover the subset a
//! client under test needs: simple strings, errors, integers, bulk strings,
//! null, and flat arrays of bulk strings. There are no nested arrays and no
//! RESP3 types.

use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use redis_protocol::resp2::encode::encode_bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const BULK_STRING_PREFIX: u8 = b'$';
pub const ARRAY_PREFIX: u8 = b'*';

const CRLF: &[u8] = b"\r\n";

/// Longest accepted header line (`*<count>\r\n` or `$<len>\r\n`). An i64
/// length needs at most 20 digits.
pub const MAX_LINE_LEN: usize = 64;

/// Value surfaced for a null bulk string (`$-1`) inside a request: the raw line.
pub const NULL_BULK: &[u8] = b"$-1\r\n";

pub fn is_null_bulk(arg: &[u8]) -> bool {
    arg == NULL_BULK
}

/// Upper bounds on declared sizes, checked before anything is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_bulk_len: usize,
    pub max_array_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bulk_len: 512 * 1024 * 1024,
            max_array_len: 1024 * 1024,
        }
    }
}

/// One decoded request. The name is ASCII upper-cased; arguments are the raw
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: Bytes,
    pub args: Vec<Bytes>,
}

impl Command {
    pub fn new<N, I, A>(name: N, args: I) -> Self
    where
        N: AsRef<[u8]>,
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self {
            name: Bytes::from(name.as_ref().to_ascii_uppercase()),
            args: args
                .into_iter()
                .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
                .collect(),
        }
    }

    /// The name for logs and error messages.
    pub fn display_name(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// Read one request array from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of a
/// request. Anything else that stops a request from being fully decoded is a
/// `ProtocolError`, after which the stream can no longer be trusted.
pub async fn read_command<R>(reader: &mut R, limits: &Limits) -> Result<Option<Command>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(elements) = read_array(reader, limits).await? else {
        return Ok(None);
    };

    let mut elements = elements.into_iter();
    let name = elements.next().ok_or(ProtocolError::InvalidSyntax)?;

    Ok(Some(Command {
        name: Bytes::from(name.to_ascii_uppercase()),
        args: elements.collect(),
    }))
}

async fn read_array<R>(reader: &mut R, limits: &Limits) -> Result<Option<Vec<Bytes>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };

    if line[0] != ARRAY_PREFIX {
        return Err(ProtocolError::InvalidSyntax);
    }

    let count = parse_length(&line)?;
    if count > limits.max_array_len as i64 {
        return Err(ProtocolError::TooLarge {
            kind: "array",
            len: count,
            max: limits.max_array_len,
        });
    }

    // A zero or negative count yields no elements, which the caller rejects.
    let mut elements = Vec::with_capacity(count.clamp(0, 64) as usize);
    for _ in 0..count {
        elements.push(read_bulk_string(reader, limits).await?);
    }

    Ok(Some(elements))
}

async fn read_bulk_string<R>(reader: &mut R, limits: &Limits) -> Result<Bytes, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?.ok_or(ProtocolError::Truncated)?;

    if line[0] != BULK_STRING_PREFIX {
        return Err(ProtocolError::InvalidSyntax);
    }

    let len = parse_length(&line)?;
    if len < 0 {
        return Ok(Bytes::from(line));
    }
    if len > limits.max_bulk_len as i64 {
        return Err(ProtocolError::TooLarge {
            kind: "bulk string",
            len,
            max: limits.max_bulk_len,
        });
    }

    let mut buf = vec![0u8; len as usize + CRLF.len()];
    reader.read_exact(&mut buf).await?;
    if !buf.ends_with(CRLF) {
        return Err(ProtocolError::InvalidSyntax);
    }
    buf.truncate(len as usize);

    Ok(Bytes::from(buf))
}

/// Read up to and including `\n`, at most [`MAX_LINE_LEN`] bytes. A line
/// needs a prefix, content and the terminator, so anything shorter than three
/// bytes is rejected.
async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64);
    if limited.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\n") {
        if line.len() >= MAX_LINE_LEN {
            return Err(ProtocolError::TooLarge {
                kind: "line",
                len: line.len() as i64,
                max: MAX_LINE_LEN,
            });
        }
        return Err(ProtocolError::Truncated);
    }
    if line.len() < 3 {
        return Err(ProtocolError::InvalidSyntax);
    }
    Ok(Some(line))
}

/// Decimal length between the prefix byte and the two terminator bytes.
fn parse_length(line: &[u8]) -> Result<i64, ProtocolError> {
    let field = &line[1..line.len() - CRLF.len()];
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidLength {
            field: String::from_utf8_lossy(field).into_owned(),
        })
}

/// `+<text>\r\n`, whitespace in `text` replaced by spaces.
pub fn encode_simple_string(buf: &mut BytesMut, text: &str) {
    encode(buf, &BytesFrame::SimpleString(Bytes::from(single_line(text))));
}

/// `-<message>\r\n`, whitespace in `message` replaced by spaces.
pub fn encode_error(buf: &mut BytesMut, message: &str) {
    encode(buf, &BytesFrame::Error(single_line(message).as_str().into()));
}

pub fn encode_integer(buf: &mut BytesMut, n: i64) {
    encode(buf, &BytesFrame::Integer(n));
}

pub fn encode_bulk_string(buf: &mut BytesMut, data: &[u8]) {
    encode(buf, &BytesFrame::BulkString(Bytes::copy_from_slice(data)));
}

pub fn encode_null(buf: &mut BytesMut) {
    encode(buf, &BytesFrame::Null);
}

/// Array of bulk strings. Empty items and the literal `nil` are sent as null.
pub fn encode_array<S: AsRef<[u8]>>(buf: &mut BytesMut, items: &[S]) {
    let frames = items
        .iter()
        .map(|item| match item.as_ref() {
            item if item.is_empty() || item == b"nil" => BytesFrame::Null,
            item => BytesFrame::BulkString(Bytes::copy_from_slice(item)),
        })
        .collect();
    encode(buf, &BytesFrame::Array(frames));
}

/// Request-shaped array: every part is a bulk string, empty ones included.
pub fn encode_request<S: AsRef<[u8]>>(buf: &mut BytesMut, parts: &[S]) {
    let frames = parts
        .iter()
        .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part.as_ref())))
        .collect();
    encode(buf, &BytesFrame::Array(frames));
}

fn encode(buf: &mut BytesMut, frame: &BytesFrame) {
    // false = don't encode integers as bulk strings (standard RESP2)
    if let Err(e) = encode_bytes(buf, frame, false) {
        tracing::error!(error = %e, "RESP encode error");
    }
}

fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect()
}
