//! Host-facing entry points
//!
//! [`CallBridge`] turns the host's generic "run script" / "collect
//! garbage" calls and thread-teardown notifications into registry
//! operations on the calling thread's engine.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, error};

use crate::engine::ScriptError;
use crate::host::DispatchTable;
use crate::registry::{EngineRegistry, RegistryError};

/// Host call name of [`CallBridge::run_script`]
pub const RUNSCRIPT_CALL: &str = "runscript_rhai";

/// Host call name of [`CallBridge::run_gc`]
pub const RUNGC_CALL: &str = "rungc_rhai";

/// Errors returned to the host from a script run
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// 无法获取引擎
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// 脚本执行失败
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Id the registry uses for the calling thread
pub fn current_thread_id() -> String {
    format!("{:?}", thread::current().id())
}

#[derive(Debug)]
pub struct CallBridge {
    registry: Arc<EngineRegistry>,
    bootstrap_path: String,
}

impl CallBridge {
    /// Bridge using the bootstrap path from the registry's configuration
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        let bootstrap_path = registry.services().config.bootstrap_path.clone();
        Self {
            registry,
            bootstrap_path,
        }
    }

    pub fn with_bootstrap_path(
        mut self,
        path: impl Into<String>,
    ) -> Self {
        self.bootstrap_path = path.into();
        self
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn bootstrap_path(&self) -> &str {
        &self.bootstrap_path
    }

    /// Run `payload` on the calling thread's engine, creating it on first use
    pub fn run_script(
        &self,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, HostError> {
        self.run_script_as(&current_thread_id(), payload)
    }

    /// Run `payload` on the engine registered for `thread_id`
    pub fn run_script_as(
        &self,
        thread_id: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, HostError> {
        let engine = self.registry.get(thread_id, &self.bootstrap_path)?;
        Ok(engine.run_callback(payload)?)
    }

    /// Collect garbage in the calling thread's engine
    ///
    /// Never creates an engine. Returns the number of modules dropped.
    pub fn run_gc(&self) -> usize {
        self.run_gc_as(&current_thread_id())
    }

    pub fn run_gc_as(
        &self,
        thread_id: &str,
    ) -> usize {
        self.registry
            .lookup(thread_id)
            .map_or(0, |engine| engine.collect_garbage())
    }

    /// Host notification that `thread_id` is about to exit
    pub fn on_thread_teardown(
        &self,
        thread_id: &str,
    ) -> bool {
        debug!(topic = "registry", thread_id, "thread teardown");
        self.registry.remove(thread_id)
    }

    /// Guard that reports the calling thread's teardown when dropped
    ///
    /// Hold it for the lifetime of a worker thread.
    pub fn attach_current_thread(self: &Arc<Self>) -> ThreadGuard {
        ThreadGuard {
            bridge: self.clone(),
            thread_id: current_thread_id(),
            _not_send: PhantomData,
        }
    }

    /// Register [`RUNSCRIPT_CALL`] and [`RUNGC_CALL`] in the host's call table
    ///
    /// The registered calls hold the bridge weakly, so a table reachable
    /// from scripts does not keep the bridge alive.
    pub fn register_calls(
        self: &Arc<Self>,
        table: &DispatchTable,
    ) {
        let bridge = Arc::downgrade(self);
        table.register(RUNSCRIPT_CALL, move |payload| {
            let bridge = upgrade(&bridge)?;
            bridge.run_script(payload).map_err(|err| {
                error!(topic = "engine.run", "{RUNSCRIPT_CALL} failed: {err}");
                err.to_string()
            })
        });

        let bridge = Arc::downgrade(self);
        table.register(RUNGC_CALL, move |_| {
            let bridge = upgrade(&bridge)?;
            bridge.run_gc();
            Ok(None)
        });
    }
}

fn upgrade(bridge: &Weak<CallBridge>) -> Result<Arc<CallBridge>, String> {
    bridge
        .upgrade()
        .ok_or_else(|| "script host has been shut down".to_string())
}

/// Tears down the owning thread's engine on drop
#[derive(Debug)]
pub struct ThreadGuard {
    bridge: Arc<CallBridge>,
    thread_id: String,
    // must be dropped on the thread it was created on
    _not_send: PhantomData<*const ()>,
}

impl ThreadGuard {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.bridge.on_thread_teardown(&self.thread_id);
    }
}
