//! Template modules.
//!
//! A [`Module`] is a resolved, loaded template bundle: a name, a URI,
//! a resolved [`Version`], a filesystem view over its content and its
//! parsed `manifest.yaml`. Modules are created once per resolved entry
//! and live for the whole run.
//!
//! Template discovery walks `templates/` for `.tpl` (text) and
//! `.nontpl` (binary passthrough) files. The discovered list is
//! shuffled with a non-cryptographic PRNG so nothing downstream can
//! rely on an iteration order.

pub mod fs;

use crate::error::{Result, StencilError};
use crate::manifest::ModuleManifest;
use crate::render::template::Template;
use crate::resolver::version::Version;
use fs::ModuleFilesystem;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::RwLock;

/// File name of a module's manifest.
pub const MODULE_MANIFEST_NAME: &str = "manifest.yaml";

/// Directory every module keeps its templates under.
pub const TEMPLATES_DIR: &str = "templates";

/// A resolved, loaded template module.
#[derive(Debug)]
pub struct Module {
    /// Import path (equals the manifest's `name`)
    pub name: String,
    /// URI the module was resolved from
    pub uri: String,
    /// Resolved version
    pub version: Version,
    /// Filesystem view rooted at the module's content
    pub fs: ModuleFilesystem,
    /// Parsed module manifest
    pub manifest: ModuleManifest,
    /// Directory replacements, rendered after the pre-render passes
    rendered_dir_replacements: RwLock<HashMap<String, String>>,
}

impl Module {
    /// Load a module from its filesystem view: parse `manifest.yaml`
    /// and verify the declared name matches the import path.
    ///
    /// # Errors
    ///
    /// I/O or parse errors for the manifest, `ModuleNameMismatch` when
    /// the manifest name differs from `name`.
    pub fn load(
        name: impl Into<String>,
        uri: impl Into<String>,
        version: Version,
        fs: ModuleFilesystem,
    ) -> Result<Self> {
        let name = name.into();
        let content = fs.read_to_string(MODULE_MANIFEST_NAME)?;
        let manifest = ModuleManifest::from_yaml(&content)?;

        if manifest.name != name {
            return Err(StencilError::ModuleNameMismatch {
                manifest_name: manifest.name,
                import_path: name,
            });
        }

        tracing::debug!(module = %name, version = %version, "Module loaded");

        Ok(Self {
            name,
            uri: uri.into(),
            version,
            fs,
            manifest,
            rendered_dir_replacements: RwLock::new(HashMap::new()),
        })
    }

    /// Discover this module's templates.
    ///
    /// Walks `templates/`, keeping `.tpl` and `.nontpl` files, and
    /// shuffles the result.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors from the walk.
    pub fn discover_templates(&self) -> Result<Vec<Template>> {
        if !self.manifest.module_type.has_templates() {
            return Ok(Vec::new());
        }

        let mut templates = Vec::new();
        for path in self.fs.walk(TEMPLATES_DIR)? {
            if !path.ends_with(".tpl") && !path.ends_with(".nontpl") {
                continue;
            }
            let contents = self.fs.read(&path)?;
            let (mode, mtime) = self.fs.metadata(&path)?;
            templates.push(Template::new(&self.name, &path, contents, mode, mtime));
        }

        let mut rng = SmallRng::from_entropy();
        templates.shuffle(&mut rng);

        tracing::debug!(module = %self.name, count = templates.len(), "Templates discovered");
        Ok(templates)
    }

    /// Store the rendered directory replacements (done once, after the
    /// pre-render passes settle).
    pub fn set_dir_replacements(&self, rendered: HashMap<String, String>) {
        *self.rendered_dir_replacements.write().expect("dir replacements lock") = rendered;
    }

    /// Apply this module's rendered directory replacements to `path`,
    /// segment by segment.
    #[must_use]
    pub fn apply_dir_replacements(&self, path: &str) -> String {
        let replacements = self.rendered_dir_replacements.read().expect("dir replacements lock");
        if replacements.is_empty() {
            return path.to_string();
        }
        path.split('/')
            .map(|segment| {
                replacements
                    .get(segment)
                    .map_or(segment, String::as_str)
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}
