//! scripthost: per-thread embedded script engines with a remote debug port
//!
//! Every host worker thread that runs scripts gets its own
//! [rhai](https://rhai.rs) engine, created on first use from a bootstrap
//! script. Engines can optionally wait for a debugger to connect over TCP
//! before serving their first call.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scripthost::host::{DispatchTable, FsResourceLoader, HostServices};
//! use scripthost::util::config::HostConfig;
//!
//! let services = HostServices::new(
//!     Arc::new(FsResourceLoader::new("scripts")),
//!     Arc::new(DispatchTable::new()),
//!     HostConfig::default(),
//! );
//! let bridge = scripthost::start(services);
//! let _guard = bridge.attach_current_thread();
//! let output = bridge.run_script(br#"{"module":"m","func":"f","args":[]}"#);
//! # drop(output);
//! scripthost::shutdown();
//! ```

#![doc(html_root_url = "https://docs.rs/scripthost")]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod debug;
pub mod engine;
pub mod host;
pub mod registry;

// Utility modules
pub mod util;

use std::sync::Arc;

use tracing::info;

use crate::host::HostServices;

pub use bridge::{CallBridge, HostError, ThreadGuard};
pub use engine::{EngineError, EngineInstance, ScriptError};
pub use registry::{EngineRegistry, RegistryError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "scripthost";

/// Install a fresh process-wide registry and return a bridge onto it
///
/// Any previously installed registry is shut down first.
pub fn start(services: HostServices) -> Arc<CallBridge> {
    let registry = registry::install(Arc::new(EngineRegistry::new(services)));
    info!(topic = "registry", version = VERSION, "script host started");
    Arc::new(CallBridge::new(registry))
}

/// Shut down the process-wide registry; returns the number of engines dropped
pub fn shutdown() -> usize {
    registry::shutdown_global()
}
