use crate::codec::{self, Command, Limits};
use crate::error::{FlushError, ProtocolError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

type Reader = BufReader<Box<dyn AsyncRead + Send + Sync + Unpin>>;
type Writer = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// A client connection as seen by command handlers.
///
/// `write_*` calls encode into a pending buffer under the connection's lock, so
/// each response frame lands in one piece even when several threads write to
/// the same connection. Nothing reaches the client until the serving loop
/// calls [`Connection::flush`].
pub struct Connection {
    reader: Reader,
    writer: Writer,
    pending: Mutex<BytesMut>,
    closed: AtomicBool,
    limits: Limits,
}

impl Connection {
    /// Wrap a transport stream (plain TCP, TLS, or an in-memory duplex).
    pub fn new<S>(stream: S, limits: Limits) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            pending: Mutex::new(BytesMut::with_capacity(4096)),
            closed: AtomicBool::new(false),
            limits,
        }
    }

    /// Read the next request. `Ok(None)` means the client hung up between requests.
    pub async fn read_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        codec::read_command(&mut self.reader, &self.limits).await
    }

    pub fn write_simple_string(&self, text: &str) {
        self.buffered(|buf| codec::encode_simple_string(buf, text));
    }

    /// Write `err` as a RESP error. Whatever `Display` renders is the message.
    pub fn write_error(&self, err: impl fmt::Display) {
        let message = err.to_string();
        self.buffered(|buf| codec::encode_error(buf, &message));
    }

    pub fn write_integer(&self, n: i64) {
        self.buffered(|buf| codec::encode_integer(buf, n));
    }

    pub fn write_bulk_string(&self, data: impl AsRef<[u8]>) {
        self.buffered(|buf| codec::encode_bulk_string(buf, data.as_ref()));
    }

    /// Write an array of bulk strings. Empty and `nil` items are sent as null.
    pub fn write_array<S: AsRef<[u8]>>(&self, items: &[S]) {
        self.buffered(|buf| codec::encode_array(buf, items));
    }

    pub fn write_null(&self) {
        self.buffered(codec::encode_null);
    }

    pub fn write_ok(&self) {
        self.write_simple_string("OK");
    }

    /// Ask the serving loop to close the connection once the current response
    /// has been flushed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Push everything buffered so far onto the transport.
    pub async fn flush(&mut self) -> Result<(), FlushError> {
        let out = self.pending.lock().split().freeze();
        if !out.is_empty() {
            self.writer.write_all(&out).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side (sends `close_notify` on TLS streams).
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    fn buffered(&self, encode: impl FnOnce(&mut BytesMut)) {
        let mut pending = self.pending.lock();
        encode(&mut pending);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("pending_bytes", &self.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
