//! 宿主配置
//!
//! The host hands every engine a read-only configuration document. Only a
//! handful of keys matter to the engines:
//!
//! ```json
//! {
//!     "debugConnectionPort": "9091",
//!     "bootstrapPath": "bootstrap.rhai",
//!     "logging": { "level": "info" }
//! }
//! ```
//!
//! An empty (or absent) `debugConnectionPort` disables debugging.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::util::logger::LogLevel;

/// Port used when debugging is requested without an explicit port
pub const DEFAULT_DEBUG_PORT: u16 = 9091;

/// Bootstrap script location used when the document does not name one
pub const DEFAULT_BOOTSTRAP_PATH: &str = "bootstrap.rhai";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 配置文档格式错误
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    /// 调试端口无法解析
    #[error("invalid debugConnectionPort: '{value}'")]
    InvalidPort { value: String },

    /// 基础端口加偏移量超出范围
    #[error("debug port out of range: base port {base} + offset {offset} exceeds 65535")]
    PortOverflow { base: u16, offset: u16 },

    /// 日志级别无法识别
    #[error("invalid log level: '{0}'")]
    InvalidLevel(String),
}

/// Host configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Base debugger port; empty means debugging is disabled
    #[serde(default)]
    pub debug_connection_port: String,
    /// Resource path of the bootstrap script
    #[serde(default = "default_bootstrap_path")]
    pub bootstrap_path: String,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level: debug, info, warn or error
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_bootstrap_path() -> String {
    DEFAULT_BOOTSTRAP_PATH.to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            debug_connection_port: String::new(),
            bootstrap_path: default_bootstrap_path(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HostConfig {
    /// Parse a JSON configuration document
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read and parse a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&bytes)
    }

    /// Config with debugging enabled on the given base port
    pub fn with_debug_port(
        mut self,
        port: u16,
    ) -> Self {
        self.debug_connection_port = port.to_string();
        self
    }

    /// Base debugger port, `None` when debugging is disabled
    ///
    /// `"0"` is treated the same as an empty value.
    pub fn debug_base_port(&self) -> Result<Option<u16>, ConfigError> {
        let raw = self.debug_connection_port.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let port: u16 = raw.parse().map_err(|_| ConfigError::InvalidPort {
            value: raw.to_string(),
        })?;
        Ok((port != 0).then_some(port))
    }

    /// Configured log level
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.logging.level.parse().map_err(ConfigError::InvalidLevel)
    }
}
