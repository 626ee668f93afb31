//! Host call registry
//!
//! Maps call names to host functions. Scripts reach it through the
//! `invoke(name, input)` bridge, and the call bridge registers the
//! `runscript_rhai` / `rungc_rhai` entry points in it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{CallDispatcher, DispatchError};

/// A registered host function
pub type HostCall = Arc<dyn Fn(&[u8]) -> Result<Option<Vec<u8>>, String> + Send + Sync>;

/// Name -> host function table
#[derive(Default)]
pub struct DispatchTable {
    calls: RwLock<HashMap<String, HostCall>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call, replacing any previous one with the same name
    pub fn register<F>(
        &self,
        name: impl Into<String>,
        call: F,
    ) where
        F: Fn(&[u8]) -> Result<Option<Vec<u8>>, String> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(topic = "dispatch", call = %name, "registering host call");
        self.calls.write().insert(name, Arc::new(call));
    }

    /// Remove a call; returns whether it was present
    pub fn unregister(
        &self,
        name: &str,
    ) -> bool {
        self.calls.write().remove(name).is_some()
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.calls.read().contains_key(name)
    }

    /// Registered call names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.calls.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl CallDispatcher for DispatchTable {
    fn invoke(
        &self,
        name: &str,
        input: &[u8],
    ) -> Result<Option<Vec<u8>>, DispatchError> {
        // 调用期间不持有锁：被调用的函数可能再次进入注册表
        let call = self
            .calls
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound {
                name: name.to_string(),
            })?;
        call(input).map_err(|message| DispatchError::Failed {
            name: name.to_string(),
            message,
        })
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("calls", &self.names())
            .finish()
    }
}
