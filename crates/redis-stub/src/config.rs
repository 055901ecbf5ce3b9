use crate::codec::Limits;
use crate::error::StubError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub fixtures: FixturesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_max_bulk_len")]
    pub max_bulk_len: usize,
    #[serde(default = "default_max_array_len")]
    pub max_array_len: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// PEM bundle of accepted client certificates. Setting it turns on mutual TLS.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter address for the standalone binary. Disabled when unset.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixturesConfig {
    #[serde(default = "default_keyspace")]
    pub keyspace: bool,
}

impl StubConfig {
    pub fn load(path: &Path) -> Result<Self, StubError> {
        let contents = std::fs::read_to_string(path).map_err(|source| StubError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: StubConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_bulk_len: self.server.max_bulk_len,
            max_array_len: self.server.max_array_len,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_bulk_len: default_max_bulk_len(),
            max_array_len: default_max_array_len(),
        }
    }
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            keyspace: default_keyspace(),
        }
    }
}

fn default_listen_addr() -> String {
    "localhost:0".to_string()
}
fn default_max_bulk_len() -> usize {
    512 * 1024 * 1024
}
fn default_max_array_len() -> usize {
    1024 * 1024
}
fn default_keyspace() -> bool {
    true
}
