//! Template binding layer.
//!
//! Exposes the `stencil`, `file` and `module` namespaces to template
//! expressions. Each namespace is a minijinja [`Object`] whose method
//! calls dispatch into the shared state, the argument resolver, the
//! module filesystem and the current output file list.
//!
//! Every template render clones its module's environment (the shared
//! parse tree) and installs fresh namespace objects bound to that
//! render's [`RenderContext`]. `module.Call` clones the *callee*
//! module's environment but binds the namespaces to the *caller's*
//! context, plus a `return` function that smuggles the call's result
//! out through a sentinel error.

use crate::args::ArgResolver;
use crate::blocks::adopt::adopt_blocks;
use crate::blocks::parse_blocks_from_path;
use crate::error::{Result, StencilError};
use crate::manifest::Lockfile;
use crate::module::Module;
use crate::render::file::File;
use crate::state::{qualified, RenderStage, SharedState};
use minijinja::value::{from_args, Object, Rest, Value};
use minijinja::{context, Environment, Error, ErrorKind, State};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Message produced when `file.*` is used from a library template.
pub const FILE_IN_LIBRARY: &str =
    "attempted to use file in a template that doesn't support file rendering";

/// Marker smuggled through the error channel by the `return` function
/// installed for `module.Call`.
const RETURN_SENTINEL: &str = "stencil::call-return";

/// A value captured by `return(value, err?)` inside a called function.
#[derive(Debug, Clone)]
pub enum ReturnValue {
    /// Normal return value
    Value(Value),
    /// Error raised by the callee, propagated as the call's error
    Error(String),
}

/// Everything one template execution needs to evaluate its bindings.
pub struct RenderContext {
    /// Which pass is executing
    pub stage: RenderStage,
    /// The shared state store
    pub state: Arc<SharedState>,
    /// Argument resolver
    pub args: Arc<ArgResolver>,
    /// Every loaded module by name
    pub modules: Arc<HashMap<String, Arc<Module>>>,
    /// Every module's parse tree by module name
    pub envs: Arc<HashMap<String, Environment<'static>>>,
    /// The invoking module
    pub module: Arc<Module>,
    /// Import path of the executing template
    pub template_path: String,
    /// Raw source of the executing template (for adoption context)
    pub template_src: String,
    /// Whether the executing template is a library template
    pub library: bool,
    /// Default mode for created files
    pub default_mode: u32,
    /// Default mtime for created files
    pub default_mtime: SystemTime,
    /// Project directory rendered files land in
    pub target_dir: PathBuf,
    /// Previous run's lockfile (empty when absent)
    pub lockfile: Arc<Mutex<Lockfile>>,
    /// Values snapshot exposed as `values`
    pub values: Value,
    /// Whether block adoption is enabled for this run
    pub adopt: bool,
    /// Output files of this execution
    pub files: Mutex<Vec<File>>,
    /// Index of the file `file.*` operates on
    pub current: Mutex<usize>,
    /// Capture cell for `module.Call`'s `return`
    pub return_slot: Mutex<Option<ReturnValue>>,
}

impl fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("template", &self.template_path)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl RenderContext {
    /// Parse (and, when enabled, adopt) the user-edit blocks of the
    /// target file at `rel_path`.
    pub fn blocks_for(&self, rel_path: &str) -> Result<HashMap<String, String>> {
        let target = self.target_dir.join(rel_path);
        let mut infos = parse_blocks_from_path(&target)?;

        if self.adopt && !self.template_src.is_empty() {
            if let Ok(target_src) = std::fs::read_to_string(&target) {
                let adopted =
                    adopt_blocks(&self.template_path, &self.template_src, &target_src, &infos)?;
                infos.extend(adopted);
            }
        }

        Ok(infos.into_iter().map(|(name, info)| (name, info.contents)).collect())
    }

    /// Run `f` over the current output file.
    pub fn with_current_file<R>(&self, f: impl FnOnce(&mut File) -> R) -> R {
        let mut files = self.files.lock().expect("file list lock");
        let index = *self.current.lock().expect("current file lock");
        f(&mut files[index])
    }

    /// Append a new output file and make it current.
    pub fn push_file(&self, file: File) {
        let mut files = self.files.lock().expect("file list lock");
        files.push(file);
        *self.current.lock().expect("current file lock") = files.len() - 1;
    }

    fn target_exists(&self, rel_path: &str) -> bool {
        self.target_dir.join(rel_path).exists()
    }
}

/// Render the body of the context's template through its module's
/// parse tree.
pub fn render_template_body(ctx: &Arc<RenderContext>) -> Result<String> {
    let base = ctx.envs.get(&ctx.module.name).ok_or_else(|| {
        StencilError::internal(format!("no parse tree for module '{}'", ctx.module.name))
    })?;

    let mut env = base.clone();
    install_namespaces(&mut env, ctx);

    let template = env.get_template(&ctx.template_path).map_err(|e| {
        StencilError::TemplateParse {
            module: ctx.module.name.clone(),
            path: ctx.template_path.clone(),
            message: e.to_string(),
        }
    })?;

    template
        .render(context! { values => ctx.values.clone(), data => Value::UNDEFINED })
        .map_err(|e| render_error(&ctx.template_path, &e))
}

/// Render an inline template source (directory replacements) with the
/// full namespace bindings of `ctx`. `label` names the source in
/// errors.
pub fn render_inline(ctx: &Arc<RenderContext>, source: &str, label: &str) -> Result<String> {
    let base = ctx.envs.get(&ctx.module.name).ok_or_else(|| {
        StencilError::internal(format!("no parse tree for module '{}'", ctx.module.name))
    })?;

    let mut env = base.clone();
    install_namespaces(&mut env, ctx);
    env.render_str(source, context! { values => ctx.values.clone(), data => Value::UNDEFINED })
        .map_err(|e| render_error(label, &e))
}

/// Register every non-binary template of a module into its
/// environment, under its import path.
pub fn register_template(
    env: &mut Environment<'static>,
    module: &str,
    import_path: &str,
    source: &str,
) -> Result<()> {
    env.add_template_owned(import_path.to_string(), source.to_string())
        .map_err(|e| StencilError::TemplateParse {
            module: module.to_string(),
            path: import_path.to_string(),
            message: e.to_string(),
        })
}

fn install_namespaces(env: &mut Environment<'static>, ctx: &Arc<RenderContext>) {
    env.add_global("stencil", Value::from_object(StencilNamespace { ctx: Arc::clone(ctx) }));
    env.add_global("file", Value::from_object(FileNamespace { ctx: Arc::clone(ctx) }));
    env.add_global("module", Value::from_object(ModuleNamespace { ctx: Arc::clone(ctx) }));
}

/// Convert a render-time error, keeping the cause chain readable.
fn render_error(path: &str, err: &Error) -> StencilError {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    StencilError::render(path, message)
}

fn invalid_op(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

fn to_engine_error(err: &StencilError) -> Error {
    invalid_op(err.to_string())
}

fn to_json(value: &Value) -> std::result::Result<serde_json::Value, Error> {
    serde_json::to_value(value)
        .map_err(|e| invalid_op(format!("value is not serializable: {e}")))
}

fn is_return_sentinel(err: &Error) -> bool {
    if err.to_string().contains(RETURN_SENTINEL) {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.to_string().contains(RETURN_SENTINEL) {
            return true;
        }
        source = cause.source();
    }
    false
}

// =============================================================================
// stencil.*
// =============================================================================

#[derive(Debug)]
struct StencilNamespace {
    ctx: Arc<RenderContext>,
}

impl Object for StencilNamespace {
    fn call_method(
        self: &Arc<Self>,
        state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> std::result::Result<Value, Error> {
        let ctx = &self.ctx;
        match method {
            "Arg" => {
                let (path,): (&str,) = from_args(args)?;
                let value = ctx
                    .args
                    .resolve(&ctx.module.name, path)
                    .map_err(|e| to_engine_error(&e))?;
                Ok(Value::from_serialize(&value))
            }
            "SetGlobal" => {
                let (name, value): (&str, Value) = from_args(args)?;
                ctx.state.set_global(&ctx.module.name, name, to_json(&value)?, &ctx.template_path);
                Ok(Value::UNDEFINED)
            }
            "GetGlobal" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(ctx
                    .state
                    .global(&ctx.module.name, name, ctx.stage)
                    .map_or(Value::UNDEFINED, |v| Value::from_serialize(&v)))
            }
            "AddToModuleHook" => {
                let (target_module, name, values): (&str, &str, Rest<Value>) = from_args(args)?;
                let values = values
                    .iter()
                    .map(to_json)
                    .collect::<std::result::Result<Vec<_>, Error>>()?;
                ctx.state
                    .add_to_module_hook(target_module, name, values, ctx.stage)
                    .map_err(|e| to_engine_error(&e))?;
                Ok(Value::UNDEFINED)
            }
            "GetModuleHook" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(Value::from_serialize(ctx.state.module_hook(&ctx.module.name, name)))
            }
            "ReadFile" => {
                let (path,): (&str,) = from_args(args)?;
                let contents =
                    ctx.module.fs.read_to_string(path).map_err(|e| to_engine_error(&e))?;
                Ok(Value::from(contents))
            }
            "ReadDir" => {
                let (path,): (&str,) = from_args(args)?;
                let entries = ctx.module.fs.read_dir(path).map_err(|e| to_engine_error(&e))?;
                Ok(Value::from_serialize(
                    entries
                        .iter()
                        .map(|e| {
                            serde_json::json!({"name": e.name, "dir": e.is_dir})
                        })
                        .collect::<Vec<_>>(),
                ))
            }
            "Exists" => {
                let (path,): (&str,) = from_args(args)?;
                Ok(Value::from(ctx.module.fs.exists(path)))
            }
            "ReadBlocks" => {
                let (path,): (&str,) = from_args(args)?;
                // A missing file yields an empty map, not an error.
                if !ctx.module.fs.exists(path) {
                    return Ok(Value::from_serialize(HashMap::<String, String>::new()));
                }
                let contents =
                    ctx.module.fs.read_to_string(path).map_err(|e| to_engine_error(&e))?;
                let blocks = crate::blocks::parse_blocks(path, &contents)
                    .map_err(|e| to_engine_error(&e))?;
                let map: HashMap<String, String> =
                    blocks.into_iter().map(|(name, info)| (name, info.contents)).collect();
                Ok(Value::from_serialize(map))
            }
            "Include" => {
                let (name, data): (&str, Option<Value>) = from_args(args)?;
                include_template(state, ctx, name, data)
            }
            "Debug" => {
                let parts: Vec<String> = args.iter().map(ToString::to_string).collect();
                tracing::debug!(template = %ctx.template_path, "{}", parts.join(" "));
                Ok(Value::UNDEFINED)
            }
            "Error" => {
                let (message,): (&str,) = from_args(args)?;
                Err(invalid_op(message.to_string()))
            }
            other => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("stencil has no method '{other}'"),
            )),
        }
    }
}

/// Render a named sub-template from the current module's parse tree:
/// exact import path first, then module-qualified forms. The caller's
/// values stay in scope; only `data` is replaced.
fn include_template(
    state: &State<'_, '_>,
    ctx: &Arc<RenderContext>,
    name: &str,
    data: Option<Value>,
) -> std::result::Result<Value, Error> {
    let data = data.unwrap_or(Value::UNDEFINED);
    let candidates = [
        name.to_string(),
        format!("{}/{name}", ctx.module.name),
        format!("{}/templates/{name}", ctx.module.name),
    ];
    for candidate in &candidates {
        if let Ok(template) = state.env().get_template(candidate) {
            return template
                .render(context! {
                    values => ctx.values.clone(),
                    data => data.clone(),
                })
                .map(Value::from);
        }
    }
    Err(invalid_op(format!(
        "template '{name}' is not defined in module '{}'",
        ctx.module.name
    )))
}

// =============================================================================
// file.*
// =============================================================================

#[derive(Debug)]
struct FileNamespace {
    ctx: Arc<RenderContext>,
}

impl Object for FileNamespace {
    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> std::result::Result<Value, Error> {
        let ctx = &self.ctx;
        if ctx.library {
            return Err(invalid_op(FILE_IN_LIBRARY));
        }

        match method {
            "Block" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(Value::from(
                    ctx.with_current_file(|f| f.block(name).unwrap_or_default().to_string()),
                ))
            }
            "BlockI" => {
                let (name,): (&str,) = from_args(args)?;
                let contents =
                    ctx.with_current_file(|f| f.block(name).unwrap_or_default().to_string());
                if contents.is_empty() {
                    Ok(Value::from(contents))
                } else {
                    Ok(Value::from(format!("\n{contents}")))
                }
            }
            "SetPath" => {
                let (path,): (&str,) = from_args(args)?;
                let rewritten = ctx.module.apply_dir_replacements(path);
                let blocks = ctx.blocks_for(&rewritten).map_err(|e| to_engine_error(&e))?;
                ctx.with_current_file(|f| {
                    f.path = rewritten.clone();
                    f.blocks = blocks;
                });
                Ok(Value::UNDEFINED)
            }
            "SetContents" => {
                let (contents,): (&str,) = from_args(args)?;
                ctx.with_current_file(|f| f.set_contents(contents));
                Ok(Value::UNDEFINED)
            }
            "SetMode" => {
                let (mode,): (u32,) = from_args(args)?;
                ctx.with_current_file(|f| f.mode = mode);
                Ok(Value::UNDEFINED)
            }
            "Skip" => {
                let (reason,): (&str,) = from_args(args)?;
                ctx.with_current_file(|f| f.skip(reason));
                Ok(Value::UNDEFINED)
            }
            "Delete" => {
                let path = ctx.with_current_file(|f| {
                    f.delete();
                    f.path.clone()
                });
                ctx.lockfile.lock().expect("lockfile lock").remove_file(&path);
                Ok(Value::UNDEFINED)
            }
            "Static" => {
                let (path, exists) =
                    ctx.with_current_file(|f| (f.path.clone(), ctx.target_exists(&f.path)));
                if exists {
                    ctx.with_current_file(|f| f.skip("static file already exists"));
                    tracing::debug!(path = %path, "Static target exists, skipping");
                }
                Ok(Value::UNDEFINED)
            }
            "Once" => {
                let path = ctx.with_current_file(|f| f.path.clone());
                let in_lockfile = ctx.lockfile.lock().expect("lockfile lock").has_file(&path);
                if ctx.target_exists(&path) || in_lockfile {
                    ctx.with_current_file(|f| f.skip("file is only rendered once"));
                }
                Ok(Value::UNDEFINED)
            }
            "Create" => {
                let (path, mode, mtime): (&str, Option<u32>, Option<i64>) = from_args(args)?;
                let rewritten = ctx.module.apply_dir_replacements(path);
                let mut file = File::new(
                    rewritten.clone(),
                    mode.unwrap_or(ctx.default_mode),
                    mtime
                        .map(|secs| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64))
                        .unwrap_or(ctx.default_mtime),
                );
                file.blocks = ctx.blocks_for(&rewritten).map_err(|e| to_engine_error(&e))?;
                ctx.push_file(file);
                Ok(Value::UNDEFINED)
            }
            "RemoveAll" => {
                let (path,): (&str,) = from_args(args)?;
                let mut file = File::new(path, ctx.default_mode, ctx.default_mtime);
                file.delete();
                let previous = *ctx.current.lock().expect("current file lock");
                ctx.push_file(file);
                *ctx.current.lock().expect("current file lock") = previous;
                Ok(Value::UNDEFINED)
            }
            "MigrateTo" => {
                let (new_path,): (&str,) = from_args(args)?;
                let old_path = ctx.with_current_file(|f| f.path.clone());
                if !ctx.target_exists(&old_path) {
                    ctx.with_current_file(|f| f.skip("migration source does not exist"));
                    return Ok(Value::UNDEFINED);
                }

                let rewritten = ctx.module.apply_dir_replacements(new_path);
                let old_blocks = ctx.blocks_for(&old_path).map_err(|e| to_engine_error(&e))?;
                let new_blocks = ctx.blocks_for(&rewritten).map_err(|e| to_engine_error(&e))?;
                ctx.with_current_file(|f| {
                    f.path = rewritten.clone();
                    f.blocks = new_blocks;
                    // The migrated file's edits win over anything at
                    // the destination.
                    f.blocks.extend(old_blocks);
                });

                let mut removal = File::new(&old_path, ctx.default_mode, ctx.default_mtime);
                removal.delete();
                ctx.lockfile.lock().expect("lockfile lock").remove_file(&old_path);
                let previous = *ctx.current.lock().expect("current file lock");
                ctx.push_file(removal);
                *ctx.current.lock().expect("current file lock") = previous;
                Ok(Value::UNDEFINED)
            }
            "Path" => Ok(Value::from(ctx.with_current_file(|f| f.path.clone()))),
            other => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("file has no method '{other}'"),
            )),
        }
    }
}

// =============================================================================
// module.*
// =============================================================================

#[derive(Debug)]
struct ModuleNamespace {
    ctx: Arc<RenderContext>,
}

impl Object for ModuleNamespace {
    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> std::result::Result<Value, Error> {
        let ctx = &self.ctx;
        match method {
            "Export" => {
                let (name,): (&str,) = from_args(args)?;
                if !ctx.library {
                    return Err(invalid_op(
                        "functions can only be exported from library templates",
                    ));
                }
                if !name.chars().next().is_some_and(char::is_uppercase) {
                    return Err(invalid_op(format!(
                        "exported function '{name}' must begin with an upper-case letter"
                    )));
                }
                ctx.state
                    .export_function(&ctx.module.name, name, &ctx.template_path, ctx.stage)
                    .map_err(|e| to_engine_error(&e))?;
                Ok(Value::UNDEFINED)
            }
            "Call" => {
                let (name, data): (&str, Option<Value>) = from_args(args)?;
                call_function(ctx, name, data)
            }
            other => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("module has no method '{other}'"),
            )),
        }
    }
}

/// Invoke an exported function: clone the callee module's parse tree,
/// evaluate the exporting template against the caller's context and
/// capture its `return` value.
fn call_function(
    ctx: &Arc<RenderContext>,
    name: &str,
    data: Option<Value>,
) -> std::result::Result<Value, Error> {
    let (module_name, fn_name) = name
        .rsplit_once('.')
        .ok_or_else(|| invalid_op(format!("'{name}' is not a '<module>.<Function>' name")))?;

    let key = qualified(module_name, fn_name);
    let Some(function) = ctx.state.function(&key) else {
        // The exporting library template may simply not have run yet;
        // the fixed-point loop re-executes this call once it has.
        if ctx.stage == RenderStage::Pre {
            tracing::debug!(function = %key, "Function not yet exported");
            return Ok(Value::UNDEFINED);
        }
        return Err(invalid_op(format!("function '{key}' is not exported")));
    };

    let base = ctx
        .envs
        .get(module_name)
        .ok_or_else(|| invalid_op(format!("module '{module_name}' is not loaded")))?;

    let mut env = base.clone();
    // The callee evaluates file/stencil bindings against the caller.
    install_namespaces(&mut env, ctx);
    {
        let slot = Arc::clone(ctx);
        env.add_function(
            "return",
            move |value: Option<Value>, error: Option<Value>| -> std::result::Result<Value, Error> {
                let captured = match error {
                    Some(err) if !err.is_none() && !err.is_undefined() => {
                        ReturnValue::Error(err.to_string())
                    }
                    _ => ReturnValue::Value(value.unwrap_or(Value::UNDEFINED)),
                };
                *slot.return_slot.lock().expect("return slot lock") = Some(captured);
                Err(invalid_op(RETURN_SENTINEL))
            },
        );
    }

    let template = env
        .get_template(&function.source_template)
        .map_err(|e| invalid_op(format!("function source '{}': {e}", function.source_template)))?;

    let previous = ctx.return_slot.lock().expect("return slot lock").take();
    let outcome = template.render(context! {
        values => ctx.values.clone(),
        data => data.unwrap_or(Value::UNDEFINED),
    });
    let captured =
        std::mem::replace(&mut *ctx.return_slot.lock().expect("return slot lock"), previous);

    match outcome {
        Ok(_) => Ok(Value::UNDEFINED),
        Err(err) if is_return_sentinel(&err) => match captured {
            Some(ReturnValue::Value(value)) => Ok(value),
            Some(ReturnValue::Error(message)) => Err(invalid_op(message)),
            None => Ok(Value::UNDEFINED),
        },
        Err(err) => Err(err),
    }
}
