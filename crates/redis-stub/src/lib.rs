//! An in-process Redis stub for testing Redis clients.
//!
//! [`StubServer`] listens on a loopback port (plain TCP or TLS), decodes RESP
//! requests and dispatches them to handlers registered by the test. It keeps
//! counters and a full command history so tests can assert on exactly what
//! the client sent.
//!
//! ```no_run
//! # async fn demo() {
//! let server = redis_stub::harness::run().await;
//! server.register("GET", |conn, args| match args {
//!     [key] if key == "greeting" => conn.write_bulk_string("hello"),
//!     [_] => conn.write_null(),
//!     _ => conn.write_error("ERR wrong number of arguments for 'get' command"),
//! });
//! // point the client under test at server.local_addr() ...
//! assert_eq!(server.handled_commands(), 0);
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod fixtures;
pub mod harness;
pub mod server;
pub mod tls;

pub use codec::{Command, Limits};
pub use config::StubConfig;
pub use connection::Connection;
pub use error::{FlushError, ProtocolError, StubError};
pub use server::{Handler, StubServer};
