//! 脚本引擎实例
//!
//! One [`EngineInstance`] wraps one rhai interpreter together with the
//! compiled bootstrap script and its global scope. Engines are created per
//! host thread by the registry and are never shared between threads while a
//! script runs.
//!
//! Construction:
//!
//! 1. build the interpreter and register the host bridges (`load`, `invoke`,
//!    module import through the resource loader)
//! 2. evaluate the bootstrap script at top level
//! 3. when `debugConnectionPort` is set, take the next debug port, listen on
//!    it, block until a debugger connects and attach it
//!
//! After that [`EngineInstance::run_callback`] calls the bootstrap's global
//! `run_callback(descriptor)` function for every script run. Functions
//! defined by scripts run through `load` are merged into the program once
//! the run that loaded them is over; a later definition replaces an earlier
//! one with the same name and arity.

mod bridges;
pub mod trace;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rhai::debugger::{DebuggerCommand, DebuggerEvent};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST};
use tracing::{debug, error, info};

use crate::debug::{DebugHook, DebugTransport, TransportError};
use crate::host::HostServices;
use crate::util::config::ConfigError;

use bridges::BridgeState;
pub use trace::format_stacktrace;

/// Global function every bootstrap script must define
pub const RUN_ENTRY: &str = "run_callback";

/// Source name of the bootstrap script in traces
pub const BOOTSTRAP_SOURCE: &str = "<bootstrap>";

/// A failed script evaluation, carrying a formatted trace
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{trace}")]
pub struct ScriptError {
    pub trace: String,
}

impl ScriptError {
    pub fn new(trace: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
        }
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }
}

impl From<&EvalAltResult> for ScriptError {
    fn from(err: &EvalAltResult) -> Self {
        Self::new(format_stacktrace(err))
    }
}

/// Engine construction errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 引导脚本编译或执行失败
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] ScriptError),

    /// 配置错误
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 调试连接建立失败
    #[error("debugger attach failed: {0}")]
    Transport(#[from] TransportError),
}

/// One embedded interpreter bound to a host thread
pub struct EngineInstance {
    engine: Engine,
    /// Bootstrap plus the functions of every loaded script
    program: RwLock<Arc<AST>>,
    scope: Mutex<Scope<'static>>,
    /// Scope length right after the bootstrap ran
    baseline: usize,
    state: Arc<BridgeState>,
    debug: Option<Arc<DebugHook>>,
    port: u16,
}

impl EngineInstance {
    /// Build an engine and evaluate `bootstrap_code` in it
    ///
    /// Blocks until a debugger connects when debugging is configured.
    pub fn new(
        bootstrap_code: &[u8],
        services: &HostServices,
    ) -> Result<Self, EngineError> {
        let base_port = services.config.debug_base_port()?;
        let state = Arc::new(BridgeState::default());
        let debug = base_port.map(|_| Arc::new(DebugHook::new()));

        let mut engine = Engine::new();
        bridges::register(
            &mut engine,
            services.loader.clone(),
            services.dispatcher.clone(),
            state.clone(),
        );
        route_output(&mut engine);
        if let Some(hook) = &debug {
            register_debugger(&mut engine, hook.clone(), state.clone());
        }

        let code = std::str::from_utf8(bootstrap_code)
            .map_err(|_| EngineError::Bootstrap(ScriptError::new("bootstrap code is not valid UTF-8")))?;
        let mut ast = engine.compile(code).map_err(|err| {
            EngineError::Bootstrap(ScriptError::new(format!(
                "failed to compile bootstrap: {err}"
            )))
        })?;
        ast.set_source(BOOTSTRAP_SOURCE);

        let mut scope = Scope::new();
        guarded(|| engine.run_ast_with_scope(&mut scope, &ast)).map_err(|err| {
            error!(topic = "engine.init", "bootstrap failed: {err}");
            EngineError::Bootstrap(err)
        })?;
        let baseline = scope.len();
        let ast = merge_loaded(&ast, state.loaded.take());

        let mut port = 0;
        if let (Some(base), Some(hook)) = (base_port, debug.as_ref()) {
            port = services.ports.next_port(base)?;
            attach_debugger(port, hook)?;
        }

        info!(topic = "engine.init", port, "engine ready");
        Ok(Self {
            engine,
            program: RwLock::new(Arc::new(ast)),
            scope: Mutex::new(scope),
            baseline,
            state,
            debug,
            port,
        })
    }

    /// Call the bootstrap's `run_callback` with `descriptor`
    ///
    /// A JSON descriptor is handed to the script as a map (or whatever JSON
    /// value it is); anything else is passed as a string. A string or blob
    /// result is returned as bytes, any other result as `None`.
    pub fn run_callback(
        &self,
        descriptor: &[u8],
    ) -> Result<Option<Vec<u8>>, ScriptError> {
        let Some(scope) = self.scope.try_lock() else {
            return Err(ScriptError::new(
                "engine is busy: run_callback re-entered while a script is running",
            ));
        };
        let mut scope = ScopeGuard {
            scope,
            baseline: self.baseline,
        };

        let argument = descriptor_argument(descriptor);
        let program = self.program.read().clone();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let result = guarded(|| {
            self.engine.call_fn_with_options::<Dynamic>(
                options,
                &mut scope,
                &program,
                RUN_ENTRY,
                (argument,),
            )
        });
        // loads that succeeded stay in effect even when the run failed later
        self.absorb_loaded();

        match result {
            Ok(value) if value.is_string() => Ok(value
                .into_immutable_string()
                .ok()
                .map(|s| s.as_bytes().to_vec())),
            Ok(value) if value.is_blob() => Ok(value.into_blob().ok()),
            Ok(_) => Ok(None),
            Err(err) => {
                error!(topic = "engine.run", "script failed: {err}");
                Err(err)
            }
        }
    }

    fn absorb_loaded(&self) {
        let loaded = self.state.loaded.take();
        if loaded.is_empty() {
            return;
        }
        let mut program = self.program.write();
        *program = Arc::new(merge_loaded(&program, loaded));
    }

    /// Drop imported modules and leftover scope entries
    ///
    /// Returns the number of modules dropped. Scope cleanup is skipped while
    /// a script is running on this engine.
    pub fn collect_garbage(&self) -> usize {
        let dropped = self.state.modules.clear();
        if let Some(mut scope) = self.scope.try_lock() {
            scope.rewind(self.baseline);
        }
        debug!(topic = "engine.gc", dropped, "garbage collected");
        dropped
    }

    /// Debug port in use, 0 when debugging is disabled
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_debugger_attached(&self) -> bool {
        self.debug.as_ref().is_some_and(|hook| hook.is_attached())
    }

    /// Number of cached imported modules
    pub fn module_count(&self) -> usize {
        self.state.modules.len()
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        // close the debugger connection before the interpreter goes away
        if let Some(hook) = &self.debug {
            if hook.detach() {
                debug!(topic = "engine.init", port = self.port, "debugger detached");
            }
        }
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("port", &self.port)
            .field("baseline", &self.baseline)
            .field("modules", &self.state.modules.len())
            .field("debugger_attached", &self.is_debugger_attached())
            .finish()
    }
}

/// Restores the scope to its bootstrap length on every exit path
struct ScopeGuard<'a> {
    scope: MutexGuard<'a, Scope<'static>>,
    baseline: usize,
}

impl<'a> std::ops::Deref for ScopeGuard<'a> {
    type Target = Scope<'static>;

    fn deref(&self) -> &Self::Target {
        &self.scope
    }
}

impl<'a> std::ops::DerefMut for ScopeGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.scope
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.scope.rewind(self.baseline);
    }
}

/// Run an interpreter call, turning both errors and panics into [`ScriptError`]
fn guarded<T>(call: impl FnOnce() -> Result<T, Box<EvalAltResult>>) -> Result<T, ScriptError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ScriptError::from(err.as_ref())),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(topic = "engine.run", "interpreter panicked: {message}");
            Err(ScriptError::new(format!("fatal interpreter error: {message}")))
        }
    }
}

/// Merge the function definitions of loaded scripts into `program`
fn merge_loaded(
    program: &AST,
    loaded: Vec<AST>,
) -> AST {
    if loaded.is_empty() {
        return program.clone();
    }
    let count = loaded.len();
    let mut merged = loaded.iter().fold(program.clone(), |merged, lib| merged.merge(lib));
    merged.set_source(BOOTSTRAP_SOURCE);
    debug!(topic = "engine.eval", count, "loaded definitions merged");
    merged
}

fn descriptor_argument(descriptor: &[u8]) -> Dynamic {
    serde_json::from_slice::<serde_json::Value>(descriptor)
        .ok()
        .and_then(|value| rhai::serde::to_dynamic(value).ok())
        .unwrap_or_else(|| String::from_utf8_lossy(descriptor).into_owned().into())
}

fn route_output(engine: &mut Engine) {
    engine.on_print(|text| info!(topic = "engine.print", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(
            topic = "engine.debug",
            source = source.unwrap_or("<script>"),
            line = pos.line(),
            "{text}"
        );
    });
}

/// Hook the debug session into the interpreter's statement stepping
fn register_debugger(
    engine: &mut Engine,
    hook: Arc<DebugHook>,
    state: Arc<BridgeState>,
) {
    engine.register_debugger(
        |_, debugger| debugger,
        move |_ctx, event, _node, source, pos| {
            if matches!(event, DebuggerEvent::End) {
                // loaded scripts and modules end inside the outer run
                if !state.nesting.is_nested() {
                    hook.on_finish();
                }
                return Ok(DebuggerCommand::Continue);
            }
            // keep stepping while a client is attached so it can pause us
            if hook.on_step(source, pos.line()) {
                Ok(DebuggerCommand::StepInto)
            } else {
                Ok(DebuggerCommand::Continue)
            }
        },
    );
}

fn attach_debugger(
    port: u16,
    hook: &DebugHook,
) -> Result<(), TransportError> {
    let mut transport = DebugTransport::new(port);
    transport.init()?;
    transport.wait_for_connection()?;
    if transport.is_connected() {
        hook.attach(Box::new(transport));
        info!(topic = "engine.init", port, "debugger attached");
    }
    Ok(())
}

#[cfg(test)]
mod tests;
