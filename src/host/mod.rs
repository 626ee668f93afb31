//! Host-side collaborators
//!
//! Engines never touch the file system, the host call registry or the
//! configuration directly; they go through the objects bundled in
//! [`HostServices`]:
//!
//! - [`ResourceLoader`]: `load(path) -> bytes`
//! - [`CallDispatcher`]: `invoke(name, input) -> output | error`
//! - [`HostConfig`]: the configuration document
//! - [`DebugPortAllocator`]: the process-wide debugger port counter

pub mod dispatch;
pub mod loader;

use std::sync::Arc;

pub use dispatch::{DispatchTable, HostCall};
pub use loader::{shorten_script_path, FsResourceLoader, MemoryResourceLoader};

use crate::debug::DebugPortAllocator;
use crate::util::config::HostConfig;

/// Resource loading errors
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// 资源不存在
    #[error("resource not found: [{path}]")]
    NotFound { path: String },

    /// 路径越过资源根目录
    #[error("invalid resource path: [{path}]")]
    InvalidPath { path: String },

    /// 读取失败
    #[error("failed to read resource [{path}]: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Host call dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No call registered under the name
    #[error("no host call registered for name: [{name}]")]
    NotFound { name: String },

    /// The call itself reported an error; the message is passed through as is
    #[error("{message}")]
    Failed { name: String, message: String },
}

/// Loads script sources on behalf of an engine
pub trait ResourceLoader: Send + Sync {
    fn load(
        &self,
        path: &str,
    ) -> Result<Vec<u8>, LoadError>;
}

/// Routes `invoke(name, input)` calls from scripts back into the host
pub trait CallDispatcher: Send + Sync {
    /// `Ok(None)` means the call succeeded without producing output.
    fn invoke(
        &self,
        name: &str,
        input: &[u8],
    ) -> Result<Option<Vec<u8>>, DispatchError>;
}

/// Everything an engine instance needs from its host
#[derive(Clone)]
pub struct HostServices {
    pub loader: Arc<dyn ResourceLoader>,
    pub dispatcher: Arc<dyn CallDispatcher>,
    pub config: Arc<HostConfig>,
    pub ports: Arc<DebugPortAllocator>,
}

impl HostServices {
    /// Bundle the collaborators, using the process-wide port counter
    pub fn new(
        loader: Arc<dyn ResourceLoader>,
        dispatcher: Arc<dyn CallDispatcher>,
        config: HostConfig,
    ) -> Self {
        Self {
            loader,
            dispatcher,
            config: Arc::new(config),
            ports: DebugPortAllocator::shared(),
        }
    }

    /// Replace the port counter (mostly useful for isolated hosts and tests)
    pub fn with_ports(
        mut self,
        ports: Arc<DebugPortAllocator>,
    ) -> Self {
        self.ports = ports;
        self
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}
