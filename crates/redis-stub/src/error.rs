use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Message written to the client when a request cannot be decoded.
pub const PROTOCOL_ERROR_MESSAGE: &str = "ERR invalid RESP protocol syntax";

/// Malformed or truncated request framing. Always fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid RESP protocol syntax")]
    InvalidSyntax,

    #[error("invalid length field {field:?}")]
    InvalidLength { field: String },

    #[error("{kind} length {len} exceeds limit {max}")]
    TooLarge {
        kind: &'static str,
        len: i64,
        max: usize,
    },

    #[error("stream ended in the middle of a request")]
    Truncated,

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Buffered response bytes could not be pushed onto the transport.
#[derive(Debug, Error)]
#[error("failed to flush response to client: {0}")]
pub struct FlushError(#[from] pub io::Error);

/// Failures while configuring or starting a stub server.
#[derive(Debug, Error)]
pub enum StubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not resolve bound address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error("failed to read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("certificate generation failed: {0}")]
    CertGeneration(#[from] rcgen::Error),

    #[error("invalid PEM data: {0}")]
    Pem(#[source] io::Error),

    #[error("no certificate found in PEM data")]
    NoCertificates,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}
