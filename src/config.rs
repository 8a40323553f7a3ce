//! Server configuration.
//!
//! Loaded from the YAML file named by `WICKET_CONFIG` when it is set, then
//! `LISTEN` overrides the listen address. Every field has a default, so an
//! empty file (or no file) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::parser::ParseLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Bind address, e.g. "0.0.0.0:8080". Port 0 picks a free port.
    pub listen_addr: String,

    /// Close connections with no reads or writes for this long. Unset means
    /// never.
    pub stale_connection_timeout_ms: Option<u64>,

    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_content_length: usize,
    pub max_websocket_frame_size: usize,

    /// Value of the `Server` header added to every response.
    pub server_header: String,

    /// Name of the handler executor thread.
    pub executor_thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let limits = ParseLimits::default();
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            stale_connection_timeout_ms: None,
            max_initial_line_length: limits.max_initial_line_length,
            max_header_size: limits.max_header_size,
            max_content_length: limits.max_content_length,
            max_websocket_frame_size: 8192,
            server_header: "Wicket".to_string(),
            executor_thread_name: "wicket-handler".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("WICKET_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.listen_addr = listen_addr;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr is empty".into()));
        }
        let sizes = [
            ("max_initial_line_length", self.max_initial_line_length),
            ("max_header_size", self.max_header_size),
            ("max_websocket_frame_size", self.max_websocket_frame_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.stale_connection_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "stale_connection_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_initial_line_length: self.max_initial_line_length,
            max_header_size: self.max_header_size,
            max_content_length: self.max_content_length,
        }
    }

    pub fn stale_timeout(&self) -> Option<Duration> {
        self.stale_connection_timeout_ms.map(Duration::from_millis)
    }
}
