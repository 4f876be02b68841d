//! Configuration management

use crate::tunnel::{DEFAULT_BUFFER_SIZE, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_IDLE};
use crate::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Apply `SECRET`, `BACKEND_TIMEOUT`, `LISTEN_PORT` and `PPROF_PORT`
    /// from the process environment
    pub fn apply_env(&mut self) -> Result<(), crate::Error> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), crate::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("SECRET") {
            self.server.secret = secret;
        }

        if let Some(timeout) = lookup("BACKEND_TIMEOUT") {
            self.server.backend_timeout = timeout.trim().parse().map_err(|_| {
                crate::Error::Config(format!("Invalid BACKEND_TIMEOUT: {}", timeout))
            })?;
        }

        if let Some(port) = lookup("LISTEN_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| crate::Error::Config(format!("Invalid LISTEN_PORT: {}", port)))?;
            self.server.listen = format!("0.0.0.0:{}", port);
        }

        // Unparseable or out-of-range values leave diagnostics disabled
        if let Some(port) = lookup("PPROF_PORT") {
            if let Ok(port) = port.trim().parse::<u16>() {
                if port > 0 {
                    self.server.diagnostics_listen = Some(format!("0.0.0.0:{}", port));
                }
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Passphrase that decrypts backend addresses
    pub secret: String,
    /// Backend connect timeout in seconds
    pub backend_timeout: u64,
    /// Cached addresses kept before the cache is flushed
    pub cache_capacity: usize,
    /// Read buffer size; bounds the framing line
    pub read_buffer_size: usize,
    /// Idle read buffers kept for reuse
    pub max_idle_buffers: usize,
    /// Metrics endpoint address (disabled when unset)
    pub diagnostics_listen: Option<String>,
    /// Open file limit to request at startup
    pub max_open_files: u64,
}

impl ServerConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            secret: String::new(),
            backend_timeout: 30,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            max_idle_buffers: DEFAULT_MAX_IDLE,
            diagnostics_listen: None,
            max_open_files: 1024 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: ServerConfig {
            secret: "change-me".to_string(),
            diagnostics_listen: Some("127.0.0.1:6060".to_string()),
            ..ServerConfig::default()
        },
        logging: LoggingConfig::default(),
    }
}
