//! 引擎注册表
//!
//! Maps a host thread id to that thread's [`EngineInstance`]. Engines are
//! created lazily on a thread's first script run and destroyed when the
//! host reports the thread's teardown.
//!
//! A single mutex guards the table together with the `alive` flag.
//! First-time construction happens while the mutex is held, so a thread
//! blocked waiting for its debugger also holds up other threads' first
//! lookups. Running scripts never holds the mutex.
//!
//! The process-wide registry is installed explicitly with [`install`] and
//! shut down explicitly with [`shutdown_global`]. After shutdown, teardown
//! notifications are ignored and lookups fail with
//! [`RegistryError::ShutDown`].

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineInstance};
use crate::host::{HostServices, LoadError};

const TOPIC: &str = "registry";

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// 注册表已关闭
    #[error("engine registry is shut down")]
    ShutDown,

    /// 引导脚本无法加载
    #[error("failed to load bootstrap script [{path}]: {source}")]
    Bootstrap {
        path: String,
        #[source]
        source: LoadError,
    },

    /// 引擎构造失败
    #[error("failed to create engine for thread {thread_id}: {source}")]
    Engine {
        thread_id: String,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug)]
struct RegistryState {
    alive: bool,
    table: HashMap<String, Arc<EngineInstance>>,
}

/// Thread id -> engine table
#[derive(Debug)]
pub struct EngineRegistry {
    services: HostServices,
    state: Mutex<RegistryState>,
}

impl EngineRegistry {
    pub fn new(services: HostServices) -> Self {
        Self {
            services,
            state: Mutex::new(RegistryState {
                alive: true,
                table: HashMap::new(),
            }),
        }
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    /// The engine for `thread_id`, created from `bootstrap_path` if missing
    pub fn get(
        &self,
        thread_id: &str,
        bootstrap_path: &str,
    ) -> Result<Arc<EngineInstance>, RegistryError> {
        let mut state = self.state.lock();
        if !state.alive {
            return Err(RegistryError::ShutDown);
        }
        if let Some(engine) = state.table.get(thread_id) {
            return Ok(engine.clone());
        }

        info!(topic = TOPIC, thread_id, bootstrap = bootstrap_path, "creating engine");
        let code = self
            .services
            .loader
            .load(bootstrap_path)
            .map_err(|source| RegistryError::Bootstrap {
                path: bootstrap_path.to_string(),
                source,
            })?;
        let engine = EngineInstance::new(&code, &self.services).map_err(|source| RegistryError::Engine {
            thread_id: thread_id.to_string(),
            source,
        })?;

        let engine = Arc::new(engine);
        state.table.insert(thread_id.to_string(), engine.clone());
        debug!(topic = TOPIC, thread_id, engines = state.table.len(), "engine registered");
        Ok(engine)
    }

    /// The engine for `thread_id` if one exists; never creates one
    pub fn lookup(
        &self,
        thread_id: &str,
    ) -> Option<Arc<EngineInstance>> {
        let state = self.state.lock();
        if !state.alive {
            return None;
        }
        state.table.get(thread_id).cloned()
    }

    /// Forget the engine of a thread that is going away
    ///
    /// Returns whether an engine was removed. No-op once the registry is
    /// shut down.
    pub fn remove(
        &self,
        thread_id: &str,
    ) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if !state.alive {
                debug!(topic = TOPIC, thread_id, "registry shut down, ignoring teardown");
                return false;
            }
            state.table.remove(thread_id)
        };
        // the engine (and its debugger connection) is dropped outside the lock
        match removed {
            Some(engine) => {
                if Arc::strong_count(&engine) > 1 {
                    warn!(topic = TOPIC, thread_id, "engine still in use, it is released by its last user");
                }
                debug!(topic = TOPIC, thread_id, "engine removed");
                true
            }
            None => false,
        }
    }

    /// Stop serving and drop every engine; returns how many were dropped
    ///
    /// Idempotent.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Arc<EngineInstance>> = {
            let mut state = self.state.lock();
            if !state.alive {
                return 0;
            }
            state.alive = false;
            state.table.drain().map(|(_, engine)| engine).collect()
        };
        info!(topic = TOPIC, engines = drained.len(), "registry shut down");
        drained.len()
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(
        &self,
        thread_id: &str,
    ) -> bool {
        self.state.lock().table.contains_key(thread_id)
    }
}

static GLOBAL: Lazy<RwLock<Option<Arc<EngineRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide registry, replacing (and shutting down) any
/// previous one
pub fn install(registry: Arc<EngineRegistry>) -> Arc<EngineRegistry> {
    let previous = GLOBAL.write().replace(registry.clone());
    if let Some(previous) = previous {
        previous.shutdown();
    }
    registry
}

/// The installed process-wide registry, if any
pub fn global() -> Option<Arc<EngineRegistry>> {
    GLOBAL.read().clone()
}

/// Shut down and uninstall the process-wide registry
///
/// Returns the number of engines dropped. Call before process exit.
pub fn shutdown_global() -> usize {
    let registry = GLOBAL.write().take();
    registry.map_or(0, |registry| registry.shutdown())
}
