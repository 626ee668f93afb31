//! Utility modules: logging setup and host configuration

pub mod config;
pub mod logger;
