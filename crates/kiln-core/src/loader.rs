//! Load a Rhai source module into a private engine and call into it.
//!
//! Every load builds a fresh [`Engine`] whose module resolver is rooted at the
//! extracted artifact, compiles the file under a caller-chosen namespace
//! label, and runs its top-level statements in a fresh [`Scope`]. Nothing is
//! shared between loads; dropping the [`LoadedModule`] discards everything.
//!
//! Loaded code runs with the host privileges of the embedded engine. The
//! engine is interruptible only at operation boundaries, via [`CancelFlag`].

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rhai::module_resolvers::FileModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, Scope, AST};

use crate::descriptor::MODULE_EXTENSION;
use crate::error::{KilnError, Result};

/// Cooperative interrupt shared between an orchestrator and a worker.
///
/// Once raised, the engine aborts at its next operation boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How an entrypoint name resolved inside a module.
#[derive(Debug, Clone)]
pub enum Callable {
    /// A script function declared with `fn`.
    ScriptFn,
    /// A top-level variable holding a function pointer or closure.
    Pointer(FnPtr),
}

/// A compiled module with its top-level code already run.
pub struct LoadedModule {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    module: String,
    namespace: String,
    printed: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("module", &self.module)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Compile `file` as `module` inside `namespace`, executing its top-level code.
///
/// `root` anchors `import` statements inside the script.
pub fn load_module(
    root: &Path,
    file: &Path,
    module: &str,
    namespace: &str,
    cancel: &CancelFlag,
) -> Result<LoadedModule> {
    let source = fs::read_to_string(file)?;
    let printed = Arc::new(Mutex::new(Vec::new()));

    let mut engine = Engine::new();
    engine.set_module_resolver(FileModuleResolver::new_with_path_and_extension(
        root,
        MODULE_EXTENSION,
    ));

    let sink = Arc::clone(&printed);
    engine.on_print(move |line| {
        if let Ok(mut lines) = sink.lock() {
            lines.push(line.to_string());
        }
    });

    let debug_sink = Arc::clone(&printed);
    engine.on_debug(move |line, _src, pos| {
        if let Ok(mut lines) = debug_sink.lock() {
            lines.push(format!("[debug {pos}] {line}"));
        }
    });

    let flag = cancel.clone();
    engine.on_progress(move |_ops| {
        if flag.is_raised() {
            Some("interrupted".into())
        } else {
            None
        }
    });

    let mut ast = engine
        .compile(&source)
        .map_err(|e| KilnError::Resolution(format!("Failed to compile module '{module}': {e}")))?;
    ast.set_source(namespace);

    let mut scope = Scope::new();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| match script_error(e) {
            KilnError::Execution(msg) => {
                KilnError::Resolution(format!("Failed to load module '{module}': {msg}"))
            }
            other => other,
        })?;

    tracing::debug!(module, namespace, "module loaded");
    Ok(LoadedModule {
        engine,
        ast,
        scope,
        module: module.to_string(),
        namespace: namespace.to_string(),
        printed,
    })
}

impl LoadedModule {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Confirm `function` names something callable in this module.
    pub fn callable(&self, function: &str) -> Result<Callable> {
        if self.ast.iter_functions().any(|f| f.name == function) {
            return Ok(Callable::ScriptFn);
        }
        match self.scope.get_value::<Dynamic>(function) {
            Some(value) => value
                .try_cast::<FnPtr>()
                .map(Callable::Pointer)
                .ok_or_else(|| KilnError::Resolution(format!("'{function}' is not callable"))),
            None => Err(KilnError::Resolution(format!(
                "Function '{function}' not found in module '{}'",
                self.module
            ))),
        }
    }

    /// Call `function` with `payload` as its only argument.
    ///
    /// Mapping results are returned as-is; anything else is wrapped as
    /// `{"result": value}`.
    pub fn invoke(&mut self, function: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let callable = self.callable(function)?;
        let arg = rhai::serde::to_dynamic(payload)
            .map_err(|e| KilnError::Execution(format!("Invalid input payload: {e}")))?;

        let returned: Dynamic = match callable {
            Callable::ScriptFn => self.engine.call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false).rewind_scope(true),
                &mut self.scope,
                &self.ast,
                function,
                (arg,),
            ),
            Callable::Pointer(fn_ptr) => fn_ptr.call::<Dynamic>(&self.engine, &self.ast, (arg,)),
        }
        .map_err(script_error)?;

        let value: serde_json::Value = rhai::serde::from_dynamic(&returned).map_err(|e| {
            KilnError::Execution(format!("Return value is not serializable: {e}"))
        })?;

        Ok(match value {
            serde_json::Value::Object(_) => value,
            other => serde_json::json!({ "result": other }),
        })
    }

    /// Drain lines written by `print` and `debug` so far.
    pub fn take_output(&self) -> Vec<String> {
        self.printed
            .lock()
            .map(|mut lines| std::mem::take(&mut *lines))
            .unwrap_or_default()
    }
}

fn script_error(err: Box<EvalAltResult>) -> KilnError {
    match *err {
        EvalAltResult::ErrorTerminated(..) => KilnError::Execution("execution interrupted".into()),
        other => KilnError::Execution(other.to_string()),
    }
}
