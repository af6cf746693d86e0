//! # Stencil
//!
//! A living-template code generator: renders source trees from
//! versioned template modules and re-renders them over time while
//! preserving user edits.
//!
//! ## Features
//!
//! - **Module resolution**: semver constraints, branches and
//!   replacements resolved over a transitive module graph, with
//!   constraint-history diagnostics on conflict
//! - **Multi-pass rendering**: templates communicate through shared
//!   state; pre-render passes iterate to a fixed point before the
//!   final pass commits files
//! - **Block preservation**: named user-edit regions in rendered
//!   output survive re-renders, with an optional adoption pass for
//!   pre-existing code
//! - **Schema-validated arguments**: JSON Schema (Draft-7) over every
//!   declared module argument, with `from` indirection across modules
//!
//! ## Example
//!
//! ```rust,no_run
//! use stencil::{RenderOptions, Stencil};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stencil = Stencil::new("./my-service")
//!         .with_options(RenderOptions::default());
//!
//!     let run = stencil.run().await?;
//!     println!("wrote {} files", run.written.len());
//!
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod blocks;
pub mod cli;
pub mod error;
pub mod manifest;
pub mod module;
pub mod render;
pub mod resolver;
pub mod schema;
pub mod state;
pub mod vcs;

pub use error::{Result, StencilError};
pub use manifest::{Lockfile, ModuleManifest, PostRunCommand, ProjectManifest};
pub use module::fs::ModuleFilesystem;
pub use module::Module;
pub use render::template::Template;
pub use render::{RenderOptions, Renderer};
pub use resolver::{Criterion, GraphResolver, Version};
pub use state::SharedState;

use crate::vcs::{GitCli, ModuleFetcher, RefLister};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The outcome of a full run: rendered templates, the files that were
/// touched on disk and the produced lockfile.
#[derive(Debug)]
pub struct RunResult {
    /// Every template with its final-pass output files
    pub templates: Vec<Template>,
    /// Paths written, relative to the project directory
    pub written: Vec<String>,
    /// Paths removed (deleted files and migrations)
    pub removed: Vec<String>,
    /// The lockfile as written next to the project manifest
    pub lockfile: Lockfile,
    /// Post-run commands declared by the modules, for the host to run
    pub post_run_commands: Vec<PostRunCommand>,
}

/// Main orchestrator: resolve the module graph, render every template
/// and commit the results.
///
/// The VCS collaborators default to shelling out to `git`; tests and
/// embedders can swap them and register in-memory modules instead.
pub struct Stencil {
    project_dir: PathBuf,
    options: RenderOptions,
    lister: Arc<dyn RefLister>,
    fetcher: Arc<dyn ModuleFetcher>,
    in_memory: Vec<(String, ModuleFilesystem)>,
}

impl Stencil {
    /// Create an orchestrator for the project at `project_dir` using
    /// the default git collaborators.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let git = Arc::new(GitCli::default());
        Self {
            project_dir: project_dir.into(),
            options: RenderOptions::default(),
            lister: Arc::clone(&git) as Arc<dyn RefLister>,
            fetcher: git,
            in_memory: Vec::new(),
        }
    }

    /// Replace the VCS collaborators.
    #[must_use]
    pub fn with_collaborators(
        mut self,
        lister: Arc<dyn RefLister>,
        fetcher: Arc<dyn ModuleFetcher>,
    ) -> Self {
        self.lister = lister;
        self.fetcher = fetcher;
        self
    }

    /// Set the render options.
    #[must_use]
    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    /// Register an in-memory replacement module.
    #[must_use]
    pub fn with_in_memory_module(mut self, name: &str, fs: ModuleFilesystem) -> Self {
        self.in_memory.push((name.to_string(), fs));
        self
    }

    /// Load the project manifest and resolve the full module set
    /// without rendering.
    ///
    /// # Errors
    ///
    /// Manifest and resolution errors.
    pub async fn resolve(&self) -> Result<(ProjectManifest, Vec<Arc<Module>>)> {
        let project = ProjectManifest::load(&self.project_dir)?;

        let mut graph = GraphResolver::new(
            Arc::clone(&self.lister),
            Arc::clone(&self.fetcher),
            self.project_dir.clone(),
        );
        for (name, fs) in &self.in_memory {
            graph = graph.with_in_memory_module(name, fs.clone());
        }

        let modules = graph.resolve(&project).await?;
        tracing::info!(modules = modules.len(), project = %project.name, "Modules resolved");
        Ok((project, modules))
    }

    /// Resolve, render and commit: the full pipeline.
    ///
    /// # Errors
    ///
    /// Any resolution, render or I/O error; the run is all-or-nothing
    /// up to the commit step.
    pub async fn run(&self) -> Result<RunResult> {
        let (project, modules) = self.resolve().await?;
        let previous_lockfile = Lockfile::load(&self.project_dir)?;

        let renderer = Renderer::new(
            project,
            modules.clone(),
            self.project_dir.clone(),
            previous_lockfile,
            self.options.clone(),
        );
        let templates = renderer.render()?;

        let result = commit(&self.project_dir, templates, &modules, &renderer)?;
        result.lockfile.write(&self.project_dir)?;

        Ok(result)
    }
}

/// Write every committable file to disk, apply deletions and produce
/// the run's lockfile.
fn commit(
    project_dir: &Path,
    templates: Vec<Template>,
    modules: &[Arc<Module>],
    renderer: &Renderer,
) -> Result<RunResult> {
    let mut written = Vec::new();
    let mut removed = Vec::new();

    // Start from the previous lockfile's file entries (minus the ones
    // file.Delete dropped) so files rendered once keep their record.
    let mut lockfile = renderer.lockfile().lock().expect("lockfile lock").clone();
    lockfile.version = env!("CARGO_PKG_VERSION").to_string();
    lockfile.generated = Some(Utc::now());
    lockfile.modules = modules
        .iter()
        .map(|m| manifest::LockfileModule {
            name: m.name.clone(),
            url: m.uri.clone(),
            version: m.version.to_string(),
        })
        .collect();

    for template in &templates {
        if template.library {
            continue;
        }
        for file in &template.files {
            let target = project_dir.join(&file.path);

            if file.deleted {
                if target.is_dir() {
                    std::fs::remove_dir_all(&target).map_err(|e| StencilError::io(&target, e))?;
                    removed.push(file.path.clone());
                } else if target.exists() {
                    std::fs::remove_file(&target).map_err(|e| StencilError::io(&target, e))?;
                    removed.push(file.path.clone());
                }
                lockfile.remove_file(&file.path);
                continue;
            }
            if file.skipped {
                tracing::debug!(
                    path = %file.path,
                    reason = file.skip_reason.as_deref().unwrap_or(""),
                    "Skipped file"
                );
                continue;
            }

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StencilError::io(parent, e))?;
            }
            std::fs::write(&target, &file.contents).map_err(|e| StencilError::io(&target, e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(file.mode))
                    .map_err(|e| StencilError::io(&target, e))?;
            }

            for warning in &file.warnings {
                tracing::warn!(path = %file.path, "{warning}");
            }

            lockfile.remove_file(&file.path);
            lockfile.files.push(manifest::LockfileFile {
                name: file.path.clone(),
                template: template.import_path(),
                module: template.module.clone(),
            });
            written.push(file.path.clone());
        }
    }

    let post_run_commands = modules
        .iter()
        .flat_map(|m| m.manifest.post_run_commands.iter().cloned())
        .collect();

    tracing::info!(written = written.len(), removed = removed.len(), "Commit complete");

    Ok(RunResult { templates, written, removed, lockfile, post_run_commands })
}
