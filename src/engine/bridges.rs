//! Host bridges registered into every engine
//!
//! - `load(path)`: fetch a script through the resource loader and run it;
//!   the functions it defines are kept and become callable from the next
//!   `run_callback` on
//! - `invoke(name[, input])`: call back into the host dispatcher
//! - `import "path" as m;`: module resolution through the same loader

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rhai::{Dynamic, Engine, EvalAltResult, Module, ModuleResolver, NativeCallContext, Position, Scope, AST};
use tracing::{debug, error};

use crate::host::{shorten_script_path, CallDispatcher, ResourceLoader};

/// Nested `load`/`import` evaluations deeper than this are rejected
const MAX_LOAD_DEPTH: usize = 32;

/// Per-engine state shared by the bridges
#[derive(Debug, Default)]
pub(crate) struct BridgeState {
    pub(crate) modules: ModuleCache,
    pub(crate) loaded: LoadedScripts,
    pub(crate) nesting: Nesting,
}

/// Register `load` and `invoke` and install the loader-backed module resolver
pub(crate) fn register(
    engine: &mut Engine,
    loader: Arc<dyn ResourceLoader>,
    dispatcher: Arc<dyn CallDispatcher>,
    state: Arc<BridgeState>,
) {
    engine.set_module_resolver(LoaderModuleResolver {
        loader: loader.clone(),
        state: state.clone(),
    });
    register_load(engine, loader, state);
    register_invoke(engine, dispatcher);
}

fn register_load(
    engine: &mut Engine,
    loader: Arc<dyn ResourceLoader>,
    state: Arc<BridgeState>,
) {
    engine.register_fn(
        "load",
        move |ctx: NativeCallContext<'_>, path: &str| -> Result<bool, Box<EvalAltResult>> {
            let pos = ctx.position();
            let _nesting = state.nesting.enter(path, pos)?;
            let ast = compile_resource(ctx.engine(), loader.as_ref(), path).map_err(|message| {
                error!(topic = "engine.eval", path, "{message}");
                runtime_error(message, pos)
            })?;
            debug!(topic = "engine.eval", path, "running loaded script");
            ctx.engine().run_ast(&ast).map_err(|err| {
                error!(topic = "engine.eval", path, "loaded script failed: {err}");
                Box::new(EvalAltResult::ErrorInModule(path.to_string(), err, pos))
            })?;
            state.loaded.push(&ast);
            Ok(true)
        },
    );
}

fn register_invoke(
    engine: &mut Engine,
    dispatcher: Arc<dyn CallDispatcher>,
) {
    let with_input = dispatcher.clone();
    engine.register_fn(
        "invoke",
        move |ctx: NativeCallContext<'_>, name: &str, input: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            let input = input_bytes(input).map_err(|message| {
                runtime_error(
                    format!("{message}\n'invoke' error for name: [{name}]"),
                    ctx.position(),
                )
            })?;
            dispatch(with_input.as_ref(), name, &input, ctx.position())
        },
    );
    engine.register_fn("invoke", move |ctx: NativeCallContext<'_>, name: &str| {
        dispatch(dispatcher.as_ref(), name, &[], ctx.position())
    });
}

fn dispatch(
    dispatcher: &dyn CallDispatcher,
    name: &str,
    input: &[u8],
    pos: Position,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let topic = format!("invoke.{name}");
    debug!(topic = %topic, input_len = input.len(), "host call");
    match dispatcher.invoke(name, input) {
        Ok(Some(output)) if !output.is_empty() => Ok(match String::from_utf8(output) {
            Ok(text) => Dynamic::from(text),
            // binary output stays binary
            Err(err) => Dynamic::from_blob(err.into_bytes()),
        }),
        // no output is null, not an error
        Ok(_) => Ok(Dynamic::UNIT),
        Err(err) => {
            error!(topic = %topic, "{err}");
            Err(runtime_error(
                format!("{err}\n'invoke' error for name: [{name}]"),
                pos,
            ))
        }
    }
}

/// Bytes handed to the dispatcher for an `invoke` input
///
/// Strings and blobs are passed as they are, `()` as no input; anything
/// else is encoded as JSON.
fn input_bytes(input: Dynamic) -> Result<Vec<u8>, String> {
    if input.is_unit() {
        return Ok(Vec::new());
    }
    if input.is_string() {
        return input
            .into_immutable_string()
            .map(|text| text.as_bytes().to_vec())
            .map_err(|kind| format!("invalid string input: {kind}"));
    }
    if input.is_blob() {
        return input
            .into_blob()
            .map_err(|kind| format!("invalid blob input: {kind}"));
    }
    serde_json::to_vec(&input).map_err(|err| format!("cannot encode input as JSON: {err}"))
}

/// Load, check and compile one script resource
///
/// The error is a plain message that always names the path.
fn compile_resource(
    engine: &Engine,
    loader: &dyn ResourceLoader,
    path: &str,
) -> Result<AST, String> {
    let bytes = loader.load(path).map_err(|err| err.to_string())?;
    if bytes.is_empty() {
        return Err(format!("empty script content: [{path}]"));
    }
    let code = String::from_utf8(bytes).map_err(|_| format!("script is not valid UTF-8: [{path}]"))?;
    let mut ast = engine
        .compile(code)
        .map_err(|err| format!("failed to compile [{path}]: {err}"))?;
    ast.set_source(shorten_script_path(path));
    Ok(ast)
}

fn runtime_error(
    message: impl Into<String>,
    pos: Position,
) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), pos))
}

/// Depth of script evaluations started by `load` or `import`
///
/// Zero while only the outermost run (bootstrap or callback) is active.
#[derive(Debug, Default)]
pub(crate) struct Nesting(AtomicUsize);

impl Nesting {
    fn enter(
        &self,
        path: &str,
        pos: Position,
    ) -> Result<NestingGuard<'_>, Box<EvalAltResult>> {
        let depth = self.0.fetch_add(1, Ordering::AcqRel);
        let guard = NestingGuard(&self.0);
        if depth >= MAX_LOAD_DEPTH {
            return Err(runtime_error(
                format!("load nested deeper than {MAX_LOAD_DEPTH} levels: [{path}]"),
                pos,
            ));
        }
        Ok(guard)
    }

    pub(crate) fn is_nested(&self) -> bool {
        self.0.load(Ordering::Acquire) > 0
    }
}

struct NestingGuard<'a>(&'a AtomicUsize);

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Function definitions of scripts run through `load`, waiting to be merged
/// into the engine's program
#[derive(Debug, Default)]
pub(crate) struct LoadedScripts {
    pending: Mutex<Vec<AST>>,
}

impl LoadedScripts {
    fn push(
        &self,
        ast: &AST,
    ) {
        self.pending.lock().push(ast.clone_functions_only());
    }

    /// Take everything loaded since the last call, in load order
    pub(crate) fn take(&self) -> Vec<AST> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Modules imported by one engine, keyed by resource path
#[derive(Debug, Default)]
pub(crate) struct ModuleCache {
    modules: RwLock<HashMap<String, Arc<Module>>>,
}

impl ModuleCache {
    fn get(
        &self,
        path: &str,
    ) -> Option<Arc<Module>> {
        self.modules.read().get(path).cloned()
    }

    fn insert(
        &self,
        path: &str,
        module: Arc<Module>,
    ) {
        self.modules.write().insert(path.to_string(), module);
    }

    pub(crate) fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Drop every cached module; returns how many were dropped
    pub(crate) fn clear(&self) -> usize {
        let mut modules = self.modules.write();
        let dropped = modules.len();
        modules.clear();
        dropped
    }
}

struct LoaderModuleResolver {
    loader: Arc<dyn ResourceLoader>,
    state: Arc<BridgeState>,
}

impl ModuleResolver for LoaderModuleResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Arc<Module>, Box<EvalAltResult>> {
        if let Some(module) = self.state.modules.get(path) {
            return Ok(module);
        }
        let _nesting = self.state.nesting.enter(path, pos)?;
        let ast = compile_resource(engine, self.loader.as_ref(), path).map_err(|message| {
            Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                runtime_error(message, pos),
                pos,
            ))
        })?;
        let mut module = Module::eval_ast_as_new(Scope::new(), &ast, engine)
            .map_err(|err| Box::new(EvalAltResult::ErrorInModule(path.to_string(), err, pos)))?;
        module.build_index();

        debug!(topic = "engine.eval", path, "module imported");
        let module = Arc::new(module);
        self.state.modules.insert(path, module.clone());
        Ok(module)
    }
}
