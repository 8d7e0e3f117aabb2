//! # Kestrel DNS Configuration
//!
//! YAML-based configuration for the Kestrel resolver.
//!
//! ## Design Philosophy
//!
//! - **Per-view**: cache, recursion, forwarding, query sources and local zones
//!   are configured per client view
//! - **Type-safe**: Strong typing with validation
//! - **Hot-reloadable**: Configuration can be updated without restart
//! - **Flexible**: Support for YAML, JSON, and TOML formats

use arc_swap::ArcSwap;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod resolver;
pub mod watch;

pub use resolver::{
    AuthViewConfig, AuthZoneConfig, ForwardViewConfig, ForwardZoneConfig, ForwardZoneKind,
    ForwarderConfig, QuerySourceConfig, RecursorViewConfig, ResolverConfig, StubViewConfig,
    StubZoneConfig,
};
pub use watch::ConfigWatcher;

/// Name of the view clients fall into when no other view matches.
pub const DEFAULT_VIEW: &str = "default";

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration for the Kestrel server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server identification and listeners.
    pub server: ServerConfig,

    /// Client views, matched in order.
    pub views: Vec<ViewConfig>,

    /// Message cache, shared settings for every view.
    pub cache: CacheConfig,

    /// Settings of the resolver stage as a whole.
    pub resolver: ResolverConfig,

    /// Recursion per view.
    pub recursor: Vec<RecursorViewConfig>,

    /// Forward zones per view.
    pub forwarder: ForwarderConfig,

    /// Stub zones per view.
    pub stub: Vec<StubViewConfig>,

    /// Outbound source address per view.
    pub query_source: Vec<QuerySourceConfig>,

    /// Locally served zones per view.
    pub auth: Vec<AuthViewConfig>,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?, // Default to YAML
        };

        Ok(config)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Names of every configured view, `default` included.
    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.iter().map(|v| v.name.clone()).collect();
        if !names.iter().any(|n| n == DEFAULT_VIEW) {
            names.push(DEFAULT_VIEW.to_string());
        }
        names
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;

        let mut seen = HashSet::new();
        for view in &self.views {
            view.validate()?;
            if !seen.insert(view.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "view {} is defined twice",
                    view.name
                )));
            }
        }

        let known: HashSet<String> = self.view_names().into_iter().collect();
        let check_view = |section: &str, view: &str| {
            if known.contains(view) {
                Ok(())
            } else {
                Err(ConfigError::invalid(
                    format!("{section}.view"),
                    format!("unknown view {view}"),
                ))
            }
        };

        for recursor in &self.recursor {
            check_view("recursor", &recursor.view)?;
        }
        for forward in &self.forwarder.views {
            check_view("forwarder", &forward.view)?;
            forward.validate()?;
        }
        for stub in &self.stub {
            check_view("stub", &stub.view)?;
            stub.validate()?;
        }
        for source in &self.query_source {
            check_view("query_source", &source.view)?;
        }
        for auth in &self.auth {
            check_view("auth", &auth.view)?;
            auth.validate()?;
        }
        self.forwarder.validate()?;

        Ok(())
    }
}

/// Server identification and listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name (for logs).
    pub name: String,

    /// Number of query handlers. Also bounds concurrent outbound resolutions.
    pub handler_count: usize,

    /// Addresses served over both UDP and TCP.
    pub listen: Vec<SocketAddr>,

    /// Serve TCP in addition to UDP.
    pub tcp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "kestrel".to_string(),
            handler_count: 512,
            listen: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53)],
            tcp: true,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.handler_count == 0 {
            return Err(ConfigError::invalid(
                "server.handler_count",
                "must be at least 1",
            ));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Validation(
                "at least one listen address is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// A client view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub name: String,

    /// Networks whose clients belong to this view.
    pub match_clients: Vec<IpNet>,
}

impl ViewConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("views.name", "must not be empty"));
        }
        Ok(())
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable caching.
    pub enabled: bool,

    /// Ceiling for positive answers (seconds).
    pub positive_ttl: u32,

    /// Ceiling for negative answers (seconds).
    pub negative_ttl: u32,

    /// Entries per view (0 = unbounded).
    pub max_cache_size: usize,

    /// Strip authority and additional sections before caching.
    pub short_answer: bool,

    /// Refresh entries that are about to expire.
    pub prefetch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            positive_ttl: 3600,
            negative_ttl: 60,
            max_cache_size: 100_000,
            short_answer: false,
            prefetch: false,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.positive_ttl == 0 {
            return Err(ConfigError::invalid("cache.positive_ttl", "must be positive"));
        }
        if self.negative_ttl == 0 {
            return Err(ConfigError::invalid("cache.negative_ttl", "must be positive"));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,

    /// Log format (text, json).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::invalid("logging.level", format!("unknown level {other}"))),
        }
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::invalid("logging.format", format!("unknown format {other}"))),
        }
    }
}

/// Thread-safe configuration holder with hot-reload support.
pub struct ConfigHolder {
    config: ArcSwap<Config>,
    path: RwLock<Option<PathBuf>>,
}

impl ConfigHolder {
    /// Creates a new configuration holder.
    pub fn new(config: Config) -> Self {
        Self {
            config: ArcSwap::new(Arc::new(config)),
            path: RwLock::new(None),
        }
    }

    /// Creates a holder from a file. The configuration is validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::from_file(path)?;
        config.validate()?;
        Ok(Self {
            config: ArcSwap::new(Arc::new(config)),
            path: RwLock::new(Some(path.to_path_buf())),
        })
    }

    /// Returns the current configuration.
    pub fn get(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// The file the configuration was loaded from, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().clone()
    }

    /// Reloads configuration from the file. The live configuration is kept
    /// if the file does not load or validate.
    pub fn reload(&self) -> Result<Arc<Config>> {
        let path = self.path.read();
        if let Some(p) = path.as_ref() {
            let config = Config::from_file(p)?;
            config.validate()?;
            self.config.store(Arc::new(config));
        }
        Ok(self.get())
    }

    /// Updates the configuration.
    pub fn update(&self, config: Config) {
        self.config.store(Arc::new(config));
    }
}

impl Default for ConfigHolder {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
