//! Configuration for the package engine.
//!
//! Configuration precedence:
//! 1. File named by the `PXE_CONFIG` environment variable
//! 2. Local config file (`./pxe.toml`)
//! 3. Defaults

use crate::packages::version::Version;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "PXE_CONFIG";

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "pxe.toml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// What to do when a newer version of an installed package shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnUpdate {
    /// Report the update and wait for the operator.
    #[default]
    Notify,
    /// Download and install it right away.
    Install,
}

/// Basic credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub user: String,
    /// Password.
    #[serde(default)]
    pub password: String,
}

/// Outbound proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy:3128`.
    pub url: String,
    /// Proxy credentials.
    #[serde(default)]
    pub auth: Option<Credentials>,
}

/// One remote package catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegistryConfig {
    /// Name shown to operators and used as source key.
    pub name: String,
    /// Base URL of the catalog server.
    pub url: String,
    /// Artifact group holding the bundles.
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Connect and read timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Server credentials.
    #[serde(default)]
    pub auth: Option<Credentials>,
    /// Outbound proxy.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_group_id() -> String {
    "com.pxe".to_string()
}

fn default_timeout_ms() -> u64 {
    1500
}

impl RemoteRegistryConfig {
    /// Creates a catalog entry with default group and timeout.
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            group_id: default_group_id(),
            timeout_ms: default_timeout_ms(),
            auth: None,
            proxy: None,
        }
    }
}

/// Update handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Policy for newer versions.
    #[serde(default)]
    pub on_update: OnUpdate,
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Chunk size used while streaming bundles.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    8192
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { chunk_size: default_chunk_size() }
    }
}

/// A peer instance to link on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's configured instance id.
    pub instance_id: String,
    /// gRPC endpoint, e.g. `http://10.0.0.2:50061`.
    pub endpoint: String,
}

/// Publication protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationConfig {
    /// Serve the publication protocol.
    #[serde(default)]
    pub enabled: bool,
    /// Address to serve on.
    #[serde(default = "default_publication_address")]
    pub address: SocketAddr,
    /// Peers to link on startup.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Locale used for display strings requested from peers.
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_publication_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50061))
}

fn default_locale() -> String {
    "en".to_string()
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_publication_address(),
            peers: Vec::new(),
            locale: default_locale(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding installed bundles.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    /// Version of the host application, checked against package compatibility.
    #[serde(default = "default_host_version")]
    pub host_version: String,
    /// Identity of this instance towards peers.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Remote catalogs.
    #[serde(default)]
    pub registries: Vec<RemoteRegistryConfig>,
    /// Update handling.
    #[serde(default)]
    pub updates: UpdateConfig,
    /// Download settings.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Publication protocol.
    #[serde(default)]
    pub publication: PublicationConfig,
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            host_version: default_host_version(),
            instance_id: default_instance_id(),
            registries: Vec::new(),
            updates: UpdateConfig::default(),
            download: DownloadConfig::default(),
            publication: PublicationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))
    }

    /// Finds and loads the configuration, falling back to defaults.
    ///
    /// A file named by `PXE_CONFIG` that fails to load is an error; a missing
    /// local file is not.
    pub fn discover_and_load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from_file(Path::new(&path));
        }

        match Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Parsed host version.
    pub fn host_version(&self) -> Result<Version> {
        Version::parse(&self.host_version)
            .map_err(|e| ConfigError::InvalidValue(format!("host_version: {}", e)))
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.host_version()?;

        if self.download.chunk_size == 0 {
            return Err(ConfigError::InvalidValue("download.chunk_size must be positive".to_string()));
        }

        let mut names = std::collections::HashSet::new();
        for registry in &self.registries {
            if registry.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue("registry name is empty".to_string()));
            }
            if !names.insert(registry.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate registry name '{}'",
                    registry.name
                )));
            }
            reqwest::Url::parse(&registry.url).map_err(|e| {
                ConfigError::InvalidValue(format!("registry '{}' url: {}", registry.name, e))
            })?;
        }

        for peer in &self.publication.peers {
            if peer.instance_id == self.instance_id {
                return Err(ConfigError::InvalidValue(format!(
                    "peer '{}' has this instance's id",
                    peer.endpoint
                )));
            }
            reqwest::Url::parse(&peer.endpoint).map_err(|e| {
                ConfigError::InvalidValue(format!("peer '{}' endpoint: {}", peer.instance_id, e))
            })?;
        }
        Ok(())
    }
}
