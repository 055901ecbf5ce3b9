use clap::Parser;
use redis_stub::fixtures::{self, Keyspace};
use redis_stub::{Command, StubConfig, StubError, StubServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "stub.toml";

#[derive(Parser, Debug)]
#[command(name = "stub-server", about = "Run a redis-stub instance outside a test process")]
struct Args {
    /// Config file (defaults to ./stub.toml when it exists)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file
    #[arg(long)]
    listen: Option<String>,

    /// Serve TLS with a freshly generated certificate
    #[arg(long)]
    tls: bool,

    /// PEM file of client certificates to require (implies --tls)
    #[arg(long)]
    client_ca: Option<PathBuf>,

    /// Print the command history as JSON on shutdown
    #[arg(long)]
    dump_history: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "redis stub failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), StubError> {
    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    if let Some(addr) = &config.metrics.listen_addr {
        install_exporter(addr);
    }

    let server = StubServer::start(&config).await?;
    if config.fixtures.keyspace {
        fixtures::install(&server, Arc::new(Keyspace::new()));
    }

    if let Some(cert) = server.tls_certificate() {
        // Clients need this to trust the stub.
        print!("{cert}");
    }
    tracing::info!(
        addr = %server.local_addr(),
        tls = server.is_secure(),
        keyspace = config.fixtures.keyspace,
        "redis stub ready"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    shutdown.cancelled().await;

    server.stop().await;
    tracing::info!(
        connections = server.handled_connections(),
        commands = server.handled_commands(),
        "redis stub shut down"
    );

    if args.dump_history {
        match serde_json::to_string_pretty(&history_json(&server.commands())) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "could not serialize command history"),
        }
    }
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<StubConfig, StubError> {
    if let Some(path) = explicit {
        let config = StubConfig::load(path)?;
        tracing::info!(path = %path.display(), "loaded config");
        return Ok(config);
    }

    let default_path = Path::new(DEFAULT_CONFIG);
    if default_path.exists() {
        let config = StubConfig::load(default_path)?;
        tracing::info!(path = DEFAULT_CONFIG, "loaded config");
        Ok(config)
    } else {
        tracing::info!("no stub.toml found, using defaults");
        Ok(StubConfig::default())
    }
}

/// History as JSON objects. Payloads that are not UTF-8 are shown lossily;
/// the dump is for people reading it.
fn history_json(commands: &[Command]) -> serde_json::Value {
    commands
        .iter()
        .map(|command| {
            let args: Vec<_> = command
                .args
                .iter()
                .map(|arg| String::from_utf8_lossy(arg))
                .collect();
            serde_json::json!({ "name": command.display_name(), "args": args })
        })
        .collect()
}

/// Command-line flags win over the config file.
fn apply_overrides(config: &mut StubConfig, args: &Args) {
    if let Some(listen) = &args.listen {
        config.server.listen_addr = listen.clone();
    }
    if args.tls {
        config.tls.enabled = true;
    }
    if let Some(path) = &args.client_ca {
        config.tls.enabled = true;
        config.tls.client_ca_path = Some(path.clone());
    }
}

fn install_exporter(addr: &str) {
    let addr: SocketAddr = match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(addr, error = %e, "invalid metrics listen address, exporter disabled");
            return;
        }
    };

    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => {
            metrics::describe_counter!(
                "redis_stub_connections_total",
                "Client connections accepted"
            );
            metrics::describe_counter!(
                "redis_stub_commands_total",
                "Requests dispatched to a registered handler"
            );
            metrics::describe_counter!(
                "redis_stub_unknown_commands_total",
                "Requests naming a command with no handler"
            );
            metrics::describe_counter!(
                "redis_stub_protocol_errors_total",
                "Connections closed on malformed RESP"
            );
            tracing::info!(%addr, "prometheus exporter listening");
        }
        Err(e) => tracing::error!(error = %e, "failed to install prometheus exporter"),
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, closing connections...");
    token.cancel();
}
