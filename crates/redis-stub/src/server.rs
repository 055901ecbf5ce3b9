use crate::codec::{Command, Limits};
use crate::config::StubConfig;
use crate::connection::Connection;
use crate::error::{StubError, PROTOCOL_ERROR_MESSAGE};
use crate::tls::{self, CertifiedPem};
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A command handler. It receives the connection and the request arguments
/// (command name excluded, raw bytes) and writes exactly one response, or
/// closes the connection.
pub type Handler = Arc<dyn Fn(&Connection, &[Bytes]) + Send + Sync>;

/// An in-process server speaking enough RESP to stand in for Redis in tests.
///
/// Binds a loopback port chosen by the OS, decodes each request, records it,
/// and hands it to the handler registered under its (upper-cased) name.
/// `COMMAND`, `PING` and `QUIT` are registered on start; anything else is up
/// to the test. All introspection is safe to call while clients are active.
///
/// A handler that panics gets its connection closed; the panic is recorded
/// and raised again from [`StubServer::stop`], so assertions inside handlers
/// still fail the test.
///
/// Dropping the server signals every task to stop without waiting for them;
/// call [`StubServer::stop`] to block until they are gone.
pub struct StubServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    certificate: Option<String>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

struct Shared {
    state: Mutex<State>,
    limits: Limits,
}

#[derive(Default)]
struct State {
    handlers: HashMap<Bytes, Handler>,
    connections: HashMap<u64, CancellationToken>,
    connection_count: usize,
    processed_commands: usize,
    history: Vec<Command>,
    handler_panics: Vec<String>,
}

/// Removes a connection from the open set when its task ends, however it ends.
struct Tracked {
    shared: Arc<Shared>,
    conn_id: u64,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.shared.untrack(self.conn_id);
    }
}

impl StubServer {
    /// Start a server as described by `config`, reading the client CA bundle
    /// from disk when mutual TLS is configured.
    pub async fn start(config: &StubConfig) -> Result<Self, StubError> {
        if !config.tls.enabled {
            return Self::bind(config, None).await;
        }

        let client_ca = match &config.tls.client_ca_path {
            Some(path) => Some(read_pem(path)?),
            None => None,
        };
        let identity = tls::generate_self_signed()?;
        Self::bind(config, Some((identity, client_ca))).await
    }

    /// Plaintext server on `localhost` with default limits.
    pub async fn start_plain() -> Result<Self, StubError> {
        Self::bind(&StubConfig::default(), None).await
    }

    /// TLS server on `localhost` with a freshly generated certificate. Passing
    /// `client_cert` (PEM) requires clients to authenticate with it.
    pub async fn start_secure(client_cert: Option<&[u8]>) -> Result<Self, StubError> {
        let identity = tls::generate_self_signed()?;
        Self::bind(
            &StubConfig::default(),
            Some((identity, client_cert.map(<[u8]>::to_vec))),
        )
        .await
    }

    async fn bind(
        config: &StubConfig,
        tls: Option<(CertifiedPem, Option<Vec<u8>>)>,
    ) -> Result<Self, StubError> {
        let (acceptor, certificate) = match tls {
            Some((identity, client_ca)) => {
                let server_config = tls::server_config(&identity, client_ca.as_deref())?;
                (Some(TlsAcceptor::from(server_config)), Some(identity.cert_pem))
            }
            None => (None, None),
        };

        let addr = &config.server.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StubError::Bind {
                addr: addr.clone(),
                source,
            })?;
        // Port 0 lets the OS pick; record what it actually gave us.
        let local_addr = listener.local_addr().map_err(StubError::LocalAddr)?;

        let server = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                limits: config.limits(),
            }),
            local_addr,
            certificate,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        server.register_builtins();

        server.tracker.spawn(accept_loop(
            listener,
            acceptor.clone(),
            Arc::clone(&server.shared),
            server.shutdown.clone(),
            server.tracker.clone(),
        ));

        tracing::info!(
            addr = %local_addr,
            tls = acceptor.is_some(),
            "redis stub listening"
        );
        Ok(server)
    }

    fn register_builtins(&self) {
        // redis-cli opens every session with COMMAND.
        self.register("COMMAND", |conn, _| conn.write_array(&["OK"]));

        self.register("PING", |conn, args| match args {
            [message] => conn.write_bulk_string(message),
            _ => conn.write_simple_string("PONG"),
        });

        self.register("QUIT", |conn, _| {
            conn.write_ok();
            conn.close();
        });
    }

    /// Register `handler` for `command` (case-insensitive), replacing any
    /// previous handler. Takes effect for the next request on every connection.
    pub fn register<F>(&self, command: &str, handler: F)
    where
        F: Fn(&Connection, &[Bytes]) + Send + Sync + 'static,
    {
        let name = command.to_ascii_uppercase();
        tracing::debug!(command = %name, "registering handler");
        self.shared
            .state
            .lock()
            .handlers
            .insert(Bytes::from(name), Arc::new(handler));
    }

    /// The address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.certificate.is_some()
    }

    /// PEM certificate presented by a secure server, for clients to trust.
    pub fn tls_certificate(&self) -> Option<&str> {
        self.certificate.as_deref()
    }

    /// Connections accepted since start.
    pub fn handled_connections(&self) -> usize {
        self.shared.state.lock().connection_count
    }

    /// Connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Requests that reached a registered handler. Unknown commands are not counted.
    pub fn handled_commands(&self) -> usize {
        self.shared.state.lock().processed_commands
    }

    /// Every decoded request in the order the server received them.
    pub fn commands(&self) -> Vec<Command> {
        self.shared.state.lock().history.clone()
    }

    /// Panic messages from handlers that have panicked so far.
    pub fn handler_panics(&self) -> Vec<String> {
        self.shared.state.lock().handler_panics.clone()
    }

    /// Stop accepting, close every open connection and wait until all
    /// connection tasks have exited. Calling it again is a no-op.
    ///
    /// # Panics
    ///
    /// On the first call, if any handler panicked while the server ran.
    pub async fn stop(&self) {
        let first = !self.shutdown.is_cancelled();
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if !first {
            return;
        }
        tracing::info!(addr = %self.local_addr, "redis stub stopped");

        let panics = self.handler_panics();
        if !panics.is_empty() {
            panic!("redis stub handler panicked: {}", panics.join("; "));
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for StubServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubServer")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.is_secure())
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, StubError> {
    std::fs::read(path).map_err(|source| StubError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let mut next_id: u64 = 0;
    let mut accept_errors: u32 = 0;

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    accept_errors += 1;
                    let delay = accept_backoff(accept_errors);
                    tracing::error!(error = %e, retry_in = ?delay, "RESP accept error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };
        accept_errors = 0;

        next_id += 1;
        let conn_id = next_id;
        let closed = CancellationToken::new();
        shared.track(conn_id, closed.clone());
        let tracked = Tracked {
            shared: Arc::clone(&shared),
            conn_id,
        };

        let acceptor = acceptor.clone();
        tracker.spawn(async move {
            tracing::debug!(peer = %peer, conn_id, "RESP client connected");
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = serve_stream(stream, acceptor, &tracked.shared, conn_id) => {}
            }
            drop(tracked);
            tracing::debug!(peer = %peer, conn_id, "RESP client disconnected");
        });
    }

    drop(listener);
    for closed in shared.state.lock().connections.values() {
        closed.cancel();
    }
}

/// Delay before retrying after `consecutive` failed accepts in a row, doubling
/// from 10ms up to one second. Keeps a persistent error such as EMFILE from
/// spinning the loop.
fn accept_backoff(consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(7);
    Duration::from_millis(10 << exponent).min(Duration::from_secs(1))
}

async fn serve_stream(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    shared: &Shared,
    conn_id: u64,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(conn_id, error = %e, "could not set TCP_NODELAY");
    }

    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => shared.serve(Connection::new(stream, shared.limits), conn_id).await,
            Err(e) => tracing::error!(conn_id, error = %e, "TLS handshake failed"),
        },
        None => shared.serve(Connection::new(stream, shared.limits), conn_id).await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Shared {
    fn track(&self, conn_id: u64, closed: CancellationToken) {
        metrics::counter!("redis_stub_connections_total").increment(1);
        let mut state = self.state.lock();
        state.connections.insert(conn_id, closed);
        state.connection_count += 1;
    }

    fn untrack(&self, conn_id: u64) {
        self.state.lock().connections.remove(&conn_id);
    }

    /// Record `command` and resolve its handler in one critical section, so
    /// history order and the processed counter always agree.
    fn admit(&self, command: &Command) -> Option<Handler> {
        let mut state = self.state.lock();
        state.history.push(command.clone());
        let handler = state.handlers.get(&command.name).cloned()?;
        state.processed_commands += 1;
        Some(handler)
    }

    /// Request/response loop for one connection. Requests are handled strictly
    /// in arrival order.
    async fn serve(&self, mut conn: Connection, conn_id: u64) {
        loop {
            let command = match conn.read_command().await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn_id, error = %e, "RESP decode error");
                    metrics::counter!("redis_stub_protocol_errors_total").increment(1);
                    conn.write_error(PROTOCOL_ERROR_MESSAGE);
                    if let Err(e) = conn.flush().await {
                        tracing::debug!(conn_id, error = %e, "could not report protocol error");
                    }
                    break;
                }
            };

            let name = command.display_name();
            match self.admit(&command) {
                Some(handler) => {
                    tracing::debug!(conn_id, command = %name, "dispatching");
                    metrics::counter!("redis_stub_commands_total").increment(1);
                    let outcome =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(&conn, &command.args)));
                    if let Err(payload) = outcome {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(conn_id, command = %name, panic = %message, "handler panicked");
                        self.state
                            .lock()
                            .handler_panics
                            .push(format!("handler for '{name}' panicked: {message}"));
                        conn.write_error(format!("ERR handler for '{name}' panicked"));
                        conn.close();
                    }
                }
                None => {
                    tracing::warn!(conn_id, command = %name, "unknown command");
                    metrics::counter!("redis_stub_unknown_commands_total").increment(1);
                    conn.write_error(format!("ERR unknown command '{name}'"));
                }
            }

            if let Err(e) = conn.flush().await {
                tracing::error!(conn_id, error = %e, "RESP write error, dropping connection");
                return;
            }

            if conn.is_closed() {
                break;
            }
        }

        if let Err(e) = conn.shutdown().await {
            tracing::debug!(conn_id, error = %e, "RESP shutdown error");
        }
    }
}
