//! Conveniences for tests: start a stub or fail the test, trust its
//! certificate, and route `tracing` output through the test harness.
//!
//! The returned [`StubServer`] signals its tasks to stop when dropped at the
//! end of a test. Await [`StubServer::stop`] when a test needs the teardown
//! to have finished.

use crate::error::StubError;
use crate::server::StubServer;
use crate::tls::{self, CertifiedPem};
use rustls::ClientConfig;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Start a plaintext stub, panicking if it cannot bind.
pub async fn run() -> StubServer {
    init_tracing();
    StubServer::start_plain()
        .await
        .unwrap_or_else(|e| panic!("could not start redis stub: {e}"))
}

/// Start a TLS stub, panicking if it cannot bind. With `client_cert` (PEM),
/// only clients presenting that certificate are accepted.
pub async fn run_secure(client_cert: Option<&[u8]>) -> StubServer {
    init_tracing();
    StubServer::start_secure(client_cert)
        .await
        .unwrap_or_else(|e| panic!("could not start secure redis stub: {e}"))
}

/// Fresh self-signed `localhost` certificate, e.g. a client identity for mutual TLS.
pub fn generate_certificate() -> Result<CertifiedPem, StubError> {
    tls::generate_self_signed()
}

/// Client config that trusts `server`'s certificate.
///
/// # Panics
///
/// If `server` is not running in secure mode.
pub fn client_tls_config(
    server: &StubServer,
    identity: Option<&CertifiedPem>,
) -> Result<Arc<ClientConfig>, StubError> {
    let cert = server
        .tls_certificate()
        .unwrap_or_else(|| panic!("stub at {} is not running TLS", server.local_addr()));
    tls::client_config(cert.as_bytes(), identity)
}

/// Install a test-friendly subscriber once per process. `RUST_LOG` applies;
/// the default level is `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
