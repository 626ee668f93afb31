//! Logger module for ScriptHost
//!
//! Go-style simple logging: `[LEVEL] message`. Every event emitted by the
//! crate carries a `topic` field naming the sub-component that produced it
//! (`engine.init`, `transport.socket`, `registry`, ...).
//!
//! # Usage
//!
//! ```rust
//! use scripthost::util::logger;
//!
//! logger::init();
//! tracing::info!(topic = "host", "Hello, {}", "world");
//! ```

use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(other.to_string()),
        }
    }
}

/// Initialize logger with default configuration (INFO level)
pub fn init() -> bool {
    init_with_level(LogLevel::Info)
}

/// Initialize logger with custom level (Go style: `[LEVEL] message`)
///
/// Returns `false` when a global subscriber was already installed, which
/// happens when several hosts (or tests) share one process.
pub fn init_with_level(level: LogLevel) -> bool {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());

    // 显示 [LEVEL] 前缀和 topic 字段，不显示时间、无颜色
    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_ansi(false)
        .with_thread_ids(true)
        .compact()
        .with_filter(filter);

    Registry::default().with(layer).try_init().is_ok()
}

/// Initialize logger for debug use (DEBUG level)
pub fn init_debug() -> bool {
    init_with_level(LogLevel::Debug)
}
