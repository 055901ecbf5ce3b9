#![allow(dead_code)]

use bytes::BytesMut;
use redis_protocol::resp2::decode::decode_bytes;
use redis_protocol::resp2::types::BytesFrame;
use redis_stub::codec::encode_request;
use redis_stub::{Command, StubServer};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Minimal RESP client for driving the stub. Responses are decoded with
/// `redis-protocol`, so any malformed frame from the stub fails the test.
pub struct RespClient<S> {
    pub stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RespClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Send one command and wait for its response.
    pub async fn send(&mut self, parts: &[&str]) -> BytesFrame {
        self.write_command(parts).await.expect("write command");
        self.read_frame()
            .await
            .expect("connection closed before a response arrived")
    }

    pub async fn write_command(&mut self, parts: &[&str]) -> std::io::Result<()> {
        let mut out = BytesMut::new();
        encode_request(&mut out, parts);
        self.write_raw(&out).await
    }

    pub async fn write_raw(&mut self, raw: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(raw).await?;
        self.stream.flush().await
    }

    /// Next complete frame, or `None` once the server has closed the stream.
    pub async fn read_frame(&mut self) -> Option<BytesFrame> {
        loop {
            let decoded = decode_bytes(&self.buf.clone().freeze()).expect("stub sent malformed RESP");
            if let Some((frame, consumed)) = decoded {
                let _ = self.buf.split_to(consumed);
                return Some(frame);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => {
                    assert!(self.buf.is_empty(), "stream ended mid-frame");
                    return None;
                }
                Ok(_) => {}
            }
        }
    }
}

pub async fn connect(server: &StubServer) -> RespClient<TcpStream> {
    let stream = TcpStream::connect(server.local_addr())
        .await
        .expect("connect to stub");
    RespClient::new(stream)
}

pub fn bulk(data: &str) -> BytesFrame {
    BytesFrame::BulkString(data.as_bytes().to_vec().into())
}

pub fn simple(text: &str) -> BytesFrame {
    BytesFrame::SimpleString(text.as_bytes().to_vec().into())
}

pub fn error_message(frame: &BytesFrame) -> &str {
    match frame {
        BytesFrame::Error(message) => &**message,
        other => panic!("expected an error frame, got {other:?}"),
    }
}

pub fn history(commands: &[&[&str]]) -> Vec<Command> {
    commands
        .iter()
        .map(|parts| Command::new(parts[0], &parts[1..]))
        .collect()
}

/// Poll `condition` until it holds or a second has passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
