//! Render orchestration.
//!
//! The renderer drives the multi-pass execution model: parse every
//! template into its module's environment, iterate pre-render passes
//! until the shared state's hash stops moving, materialise directory
//! replacements, then run the final pass whose output files are kept.
//!
//! Templates communicate through globals, module hooks and exported
//! functions; a body that reads a hook must run after every body that
//! writes it, and those writes are themselves template side effects.
//! Fixed-point iteration converges the dependencies without asking
//! authors to declare them.

pub mod engine;
pub mod file;
pub mod template;

use crate::args::ArgResolver;
use crate::error::{Result, StencilError};
use crate::manifest::{Lockfile, ProjectManifest};
use crate::module::Module;
use crate::render::engine::{render_inline, render_template_body, RenderContext, ReturnValue};
use crate::render::file::File;
use crate::render::template::Template;
use crate::state::{RenderStage, SharedState};
use minijinja::{Environment, Value};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Iteration cap for the pre-render loop.
pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Tunables for one render run.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Enable the block-adoption heuristic for existing target files
    pub adopt: bool,
    /// Pre-render iteration cap before `UnstableSharedState`
    pub max_iterations: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { adopt: false, max_iterations: DEFAULT_MAX_ITERATIONS }
    }
}

/// A module name/version pair in the values snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleVersion {
    /// Module import path
    pub name: String,
    /// Resolved version, as displayed
    pub version: String,
}

/// The immutable snapshot templates see as `values`.
#[derive(Debug, Clone, Serialize)]
pub struct Values {
    /// Project name from the manifest
    pub project_name: String,
    /// Every resolved module with its version
    pub modules: Vec<ModuleVersion>,
    /// Version of the generator itself
    pub generator_version: String,
    /// HEAD commit of the target directory, when it is a git checkout
    pub git_head: Option<String>,
}

impl Values {
    fn snapshot(project: &ProjectManifest, modules: &[Arc<Module>], target_dir: &Path) -> Self {
        Self {
            project_name: project.name.clone(),
            modules: modules
                .iter()
                .map(|m| ModuleVersion { name: m.name.clone(), version: m.version.to_string() })
                .collect(),
            generator_version: env!("CARGO_PKG_VERSION").to_string(),
            git_head: git_head(target_dir),
        }
    }
}

/// Resolve the HEAD commit of a git checkout without shelling out.
fn git_head(dir: &Path) -> Option<String> {
    let head = std::fs::read_to_string(dir.join(".git/HEAD")).ok()?;
    let head = head.trim();
    if let Some(reference) = head.strip_prefix("ref: ") {
        let sha = std::fs::read_to_string(dir.join(".git").join(reference)).ok()?;
        return Some(sha.trim().to_string());
    }
    Some(head.to_string())
}

/// Drives the multi-pass render over a resolved module set.
pub struct Renderer {
    project: ProjectManifest,
    modules: Vec<Arc<Module>>,
    module_map: Arc<HashMap<String, Arc<Module>>>,
    target_dir: PathBuf,
    lockfile: Arc<Mutex<Lockfile>>,
    options: RenderOptions,
    state: Arc<SharedState>,
    args: Arc<ArgResolver>,
}

impl Renderer {
    /// Create a renderer. `lockfile` is the previous run's lockfile,
    /// when one exists.
    #[must_use]
    pub fn new(
        project: ProjectManifest,
        modules: Vec<Arc<Module>>,
        target_dir: PathBuf,
        lockfile: Option<Lockfile>,
        options: RenderOptions,
    ) -> Self {
        let state = Arc::new(SharedState::new());
        for module in &modules {
            for (hook, decl) in &module.manifest.module_hooks {
                if let Some(schema) = &decl.schema {
                    state.register_hook_schema(&module.name, hook, schema.clone());
                }
            }
        }

        let args = Arc::new(ArgResolver::new(project.arguments.clone(), &modules));
        let module_map: Arc<HashMap<String, Arc<Module>>> =
            Arc::new(modules.iter().map(|m| (m.name.clone(), Arc::clone(m))).collect());

        Self {
            project,
            modules,
            module_map,
            target_dir,
            lockfile: Arc::new(Mutex::new(lockfile.unwrap_or_default())),
            options,
            state,
            args,
        }
    }

    /// The shared state store (exposed for tests and diagnostics).
    #[must_use]
    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// The lockfile as mutated by the run (`file.Delete` removes
    /// entries).
    #[must_use]
    pub fn lockfile(&self) -> Arc<Mutex<Lockfile>> {
        Arc::clone(&self.lockfile)
    }

    /// Execute the full render and return every template with its
    /// final-pass output files.
    ///
    /// # Errors
    ///
    /// Template parse and render errors, schema violations and
    /// `UnstableSharedState` when the pre-render loop fails to
    /// converge.
    pub fn render(&self) -> Result<Vec<Template>> {
        let mut templates = Vec::new();
        for module in &self.modules {
            templates.extend(module.discover_templates()?);
        }
        tracing::info!(
            templates = templates.len(),
            modules = self.modules.len(),
            "Starting render"
        );

        let values = Value::from_serialize(Values::snapshot(
            &self.project,
            &self.modules,
            &self.target_dir,
        ));

        // Parse phase: register every non-binary template under its
        // import path so Include and module.Call can reach it.
        let mut envs: HashMap<String, Environment<'static>> = self
            .modules
            .iter()
            .map(|m| (m.name.clone(), Environment::new()))
            .collect();
        for template in &templates {
            if template.binary {
                continue;
            }
            let source = template.source().ok_or_else(|| StencilError::TemplateParse {
                module: template.module.clone(),
                path: template.import_path(),
                message: "template is not valid UTF-8".to_string(),
            })?;
            let env = envs.get_mut(&template.module).expect("module env exists");
            engine::register_template(env, &template.module, &template.import_path(), source)?;
        }
        let envs = Arc::new(envs);

        // Pre-render loop: iterate until the state hash stops moving.
        let mut previous_hash: Option<String> = None;
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            if iterations > self.options.max_iterations {
                return Err(StencilError::UnstableSharedState {
                    iterations: self.options.max_iterations,
                });
            }

            // Hooks are rebuilt from scratch by every pass; the hash
            // stabilises once two consecutive rebuilds agree.
            self.state.reset_module_hooks();

            for template in &templates {
                if template.binary {
                    continue;
                }
                let ctx = self.context_for(template, RenderStage::Pre, &envs, &values)?;
                render_template_body(&ctx)?;
            }

            let hash = self.state.stabilise();
            tracing::debug!(iteration = iterations, hash = %hash, "Pre-render pass complete");
            if previous_hash.as_ref() == Some(&hash) {
                break;
            }
            previous_hash = Some(hash);
        }
        tracing::debug!(iterations, "Shared state stabilised");

        // Directory replacements are templates themselves; they render
        // against the settled state.
        self.materialise_dir_replacements(&envs, &values)?;

        // Final pass: keep the files.
        for template in &mut templates {
            if template.binary {
                let path = {
                    let module = &self.module_map[&template.module];
                    module.apply_dir_replacements(&template.default_output_path())
                };
                let mut output = File::new(path, template.mode, template.mtime);
                output.set_contents(template.contents.clone());
                template.files = vec![output];
                continue;
            }

            let ctx = self.context_for(template, RenderStage::Final, &envs, &values)?;
            let rendered = render_template_body(&ctx)?;

            if template.library {
                // Library bodies run purely for their side effects.
                template.files = Vec::new();
                continue;
            }

            let mut files = ctx.files.lock().expect("file list lock").clone();
            if files.len() == 1 {
                if !files[0].contents_set {
                    files[0].contents = rendered.into_bytes();
                }
            } else if files.len() > 1
                && !files[0].contents_set
                && !files[0].skipped
                && !files[0].deleted
            {
                // The untouched default was superseded by file.Create.
                files.remove(0);
            }
            template.files = files;
        }

        Ok(templates)
    }

    /// Build the render context for one template execution, with its
    /// fresh default output file.
    fn context_for(
        &self,
        template: &Template,
        stage: RenderStage,
        envs: &Arc<HashMap<String, Environment<'static>>>,
        values: &Value,
    ) -> Result<Arc<RenderContext>> {
        let module = Arc::clone(&self.module_map[&template.module]);
        let default_path = module.apply_dir_replacements(&template.default_output_path());

        let ctx = Arc::new(RenderContext {
            stage,
            state: Arc::clone(&self.state),
            args: Arc::clone(&self.args),
            modules: Arc::clone(&self.module_map),
            envs: Arc::clone(envs),
            module,
            template_path: template.import_path(),
            template_src: template.source().unwrap_or_default().to_string(),
            library: template.library,
            default_mode: template.mode,
            default_mtime: template.mtime,
            target_dir: self.target_dir.clone(),
            lockfile: Arc::clone(&self.lockfile),
            values: values.clone(),
            adopt: self.options.adopt,
            files: Mutex::new(Vec::new()),
            current: Mutex::new(0),
            return_slot: Mutex::new(None::<ReturnValue>),
        });

        let mut default_file = File::new(&default_path, template.mode, template.mtime);
        if !template.library {
            default_file.blocks = ctx.blocks_for(&default_path)?;
        }
        ctx.push_file(default_file);
        Ok(ctx)
    }

    /// Evaluate each module's directory replacements against the
    /// settled values and store them on the module.
    fn materialise_dir_replacements(
        &self,
        envs: &Arc<HashMap<String, Environment<'static>>>,
        values: &Value,
    ) -> Result<()> {
        for module in &self.modules {
            if module.manifest.dir_replacements.is_empty() {
                continue;
            }

            let mut rendered_map = HashMap::new();
            for (source, replacement) in &module.manifest.dir_replacements {
                let label = format!("{}/dirReplacements/{source}", module.name);
                let ctx = self.replacement_context(module, envs, values);
                let rendered = render_inline(&ctx, replacement, &label)?;
                if rendered.contains('/') || rendered.contains('\\') {
                    return Err(StencilError::render(
                        &label,
                        format!("directory replacement '{rendered}' must not contain a path separator"),
                    ));
                }
                rendered_map.insert(source.clone(), rendered);
            }

            tracing::debug!(module = %module.name, count = rendered_map.len(), "Directory replacements rendered");
            module.set_dir_replacements(rendered_map);
        }
        Ok(())
    }

    fn replacement_context(
        &self,
        module: &Arc<Module>,
        envs: &Arc<HashMap<String, Environment<'static>>>,
        values: &Value,
    ) -> Arc<RenderContext> {
        let ctx = Arc::new(RenderContext {
            stage: RenderStage::Final,
            state: Arc::clone(&self.state),
            args: Arc::clone(&self.args),
            modules: Arc::clone(&self.module_map),
            envs: Arc::clone(envs),
            module: Arc::clone(module),
            template_path: format!("{}/dirReplacements", module.name),
            template_src: String::new(),
            library: false,
            default_mode: 0o644,
            default_mtime: std::time::SystemTime::UNIX_EPOCH,
            target_dir: self.target_dir.clone(),
            lockfile: Arc::clone(&self.lockfile),
            values: values.clone(),
            adopt: false,
            files: Mutex::new(Vec::new()),
            current: Mutex::new(0),
            return_slot: Mutex::new(None),
        });
        ctx.push_file(File::new("", 0o644, std::time::SystemTime::UNIX_EPOCH));
        ctx
    }
}
