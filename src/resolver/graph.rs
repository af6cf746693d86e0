//! Module graph resolution.
//!
//! BFS over the transitive dependency graph declared by the project
//! manifest and each module's `manifest.yaml`. Every criterion seen
//! for a module is recorded in its constraint history; re-resolution
//! always uses the union of the history, so nested constraints narrow,
//! never widen, the chosen version. Failures carry a rendered history
//! tree naming which ancestor imposed which wants:
//!
//! ```text
//! testing-project (top-level) wants >=0.5.0
//!   nested_constraint@virtual (source: local) wants ~0.3.0
//! ```

use crate::error::{Result, StencilError};
use crate::manifest::ProjectManifest;
use crate::module::fs::ModuleFilesystem;
use crate::module::Module;
use crate::resolver::version::{Criterion, Version, VersionResolver, VirtualSource};
use crate::vcs::{ModuleFetcher, RefLister};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

/// One recorded want for a module.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The criterion an ancestor imposed
    pub criterion: Criterion,
    /// Who imposed it: `<project> (top-level)` or `<module>@<version>`
    pub parent: String,
}

/// Render a constraint history as the indented wants tree used in
/// resolution diagnostics.
#[must_use]
pub fn render_history(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .enumerate()
        .map(|(depth, entry)| {
            format!("{}{} wants {}", "  ".repeat(depth), entry.parent, entry.criterion)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Where a module's content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Remote,
    LocalPath,
    InMemory,
}

struct ModuleEntry {
    uri: String,
    source: Source,
    history: Vec<HistoryEntry>,
    module: Option<Arc<Module>>,
}

struct WorkItem {
    name: String,
    version_spec: Option<String>,
    parent: String,
}

/// Resolves the full, deduplicated set of modules a project requires.
pub struct GraphResolver {
    versions: VersionResolver,
    fetcher: Arc<dyn ModuleFetcher>,
    project_dir: PathBuf,
    in_memory: HashMap<String, ModuleFilesystem>,
}

impl GraphResolver {
    /// Create a graph resolver over the two VCS collaborators.
    /// `project_dir` anchors relative replacement paths.
    #[must_use]
    pub fn new(
        lister: Arc<dyn RefLister>,
        fetcher: Arc<dyn ModuleFetcher>,
        project_dir: PathBuf,
    ) -> Self {
        Self {
            versions: VersionResolver::new(lister),
            fetcher,
            project_dir,
            in_memory: HashMap::new(),
        }
    }

    /// Register an in-memory replacement module: `name` resolves to the
    /// given filesystem with a `virtual=in-memory` version.
    #[must_use]
    pub fn with_in_memory_module(mut self, name: &str, fs: ModuleFilesystem) -> Self {
        self.in_memory.insert(name.to_string(), fs);
        self
    }

    /// Resolve every module the project requires, transitively and
    /// deduplicated, in first-seen order.
    ///
    /// # Errors
    ///
    /// Resolution failures are wrapped with the module's rendered
    /// constraint-history tree.
    pub async fn resolve(&self, project: &ProjectManifest) -> Result<Vec<Arc<Module>>> {
        let mut entries: HashMap<String, ModuleEntry> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut queue: VecDeque<WorkItem> = project
            .modules
            .iter()
            .map(|dep| WorkItem {
                name: dep.name.clone(),
                version_spec: dep.version.clone(),
                parent: format!("{} (top-level)", project.name),
            })
            .collect();

        while let Some(item) = queue.pop_front() {
            let criterion = Criterion::from_version_spec(item.version_spec.as_deref())?;

            if !entries.contains_key(&item.name) {
                let (uri, source) = self.module_source(project, &item.name);
                entries.insert(
                    item.name.clone(),
                    ModuleEntry { uri, source, history: Vec::new(), module: None },
                );
                order.push(item.name.clone());
            }
            let entry = entries.get_mut(&item.name).expect("entry just inserted");

            let seen_before = entry.history.iter().any(|h| h.criterion == criterion);
            entry.history.push(HistoryEntry { criterion, parent: item.parent });

            // An identical criterion cannot change the resolved version.
            if seen_before && entry.module.is_some() {
                continue;
            }

            let version = match entry.source {
                Source::InMemory => Version::virtual_(VirtualSource::InMemory),
                Source::LocalPath => Version::virtual_(VirtualSource::Local),
                Source::Remote => {
                    let criteria: Vec<Criterion> =
                        entry.history.iter().map(|h| h.criterion.clone()).collect();
                    self.versions.resolve(&entry.uri, &criteria).await.map_err(|e| {
                        StencilError::Resolution {
                            module: item.name.clone(),
                            history: render_history(&entry.history),
                            source: Box::new(e),
                        }
                    })?
                }
            };

            let needs_load = entry.module.as_ref().is_none_or(|m| m.version != version);
            if !needs_load {
                continue;
            }

            let fs = self.module_fs(&item.name, &entry.uri, entry.source, &version).await?;
            let module = Arc::new(Module::load(&item.name, &entry.uri, version, fs)?);

            let parent_label = match entry.source {
                Source::Remote => format!("{}@{}", module.name, module.version),
                Source::LocalPath => {
                    format!("{}@{} (source: local)", module.name, module.version)
                }
                Source::InMemory => {
                    format!("{}@{} (source: in-memory)", module.name, module.version)
                }
            };
            for dep in &module.manifest.modules {
                queue.push_back(WorkItem {
                    name: dep.name.clone(),
                    version_spec: dep.version.clone(),
                    parent: parent_label.clone(),
                });
            }

            entry.module = Some(module);
        }

        Ok(order
            .into_iter()
            .filter_map(|name| entries.remove(&name).and_then(|e| e.module))
            .collect())
    }

    /// Derive a module's URI and source kind from the project's
    /// replacement map.
    fn module_source(&self, project: &ProjectManifest, name: &str) -> (String, Source) {
        if self.in_memory.contains_key(name) {
            return (name.to_string(), Source::InMemory);
        }
        if let Some(replacement) = project.replacements.get(name) {
            let path = replacement.strip_prefix("file://").unwrap_or(replacement);
            if replacement.starts_with("file://") || !replacement.contains("://") {
                return (path.to_string(), Source::LocalPath);
            }
            return (replacement.clone(), Source::Remote);
        }
        (format!("https://{name}"), Source::Remote)
    }

    async fn module_fs(
        &self,
        name: &str,
        uri: &str,
        source: Source,
        version: &Version,
    ) -> Result<ModuleFilesystem> {
        match source {
            Source::InMemory => Ok(self
                .in_memory
                .get(name)
                .cloned()
                .expect("in-memory module registered")),
            Source::LocalPath => {
                let path = PathBuf::from(uri);
                let root =
                    if path.is_absolute() { path } else { self.project_dir.join(path) };
                Ok(ModuleFilesystem::local(root))
            }
            Source::Remote => {
                let reference = version.git_ref().ok_or_else(|| {
                    StencilError::internal(format!("remote version of '{name}' has no git ref"))
                })?;
                let root = self.fetcher.fetch(uri, reference).await?;
                Ok(ModuleFilesystem::local(root))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ModuleDependency;
    use crate::vcs::StaticRemote;
    use pretty_assertions::assert_eq;

    fn memory_module(name: &str, manifest_extra: &str) -> ModuleFilesystem {
        ModuleFilesystem::memory()
            .with_file("manifest.yaml", format!("name: {name}\n{manifest_extra}"))
    }

    fn project(name: &str, modules: &[(&str, Option<&str>)]) -> ProjectManifest {
        ProjectManifest {
            name: name.into(),
            modules: modules
                .iter()
                .map(|(n, v)| ModuleDependency {
                    name: (*n).to_string(),
                    version: v.map(str::to_string),
                })
                .collect(),
            ..ProjectManifest::default()
        }
    }

    fn resolver() -> GraphResolver {
        GraphResolver::new(
            Arc::new(StaticRemote::new()),
            Arc::new(StaticRemote::new()),
            PathBuf::from("."),
        )
    }

    #[tokio::test]
    async fn test_resolves_transitive_in_memory_modules() {
        let resolver = resolver()
            .with_in_memory_module(
                "base",
                memory_module("base", "modules:\n  - name: nested\n"),
            )
            .with_in_memory_module("nested", memory_module("nested", ""));

        let modules = resolver
            .resolve(&project("testing-project", &[("base", None)]))
            .await
            .unwrap();

        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "base");
        assert_eq!(modules[1].name, "nested");
        assert_eq!(modules[1].version.virtual_source, Some(VirtualSource::InMemory));
    }

    #[tokio::test]
    async fn test_deduplicates_shared_dependency() {
        let resolver = resolver()
            .with_in_memory_module("a", memory_module("a", "modules:\n  - name: shared\n"))
            .with_in_memory_module("b", memory_module("b", "modules:\n  - name: shared\n"))
            .with_in_memory_module("shared", memory_module("shared", ""));

        let modules = resolver
            .resolve(&project("testing-project", &[("a", None), ("b", None)]))
            .await
            .unwrap();

        assert_eq!(modules.len(), 3);
    }

    #[tokio::test]
    async fn test_union_of_criteria_narrows_version() {
        let remote = Arc::new(StaticRemote::new().with_refs(
            "https://github.com/example/base",
            &["v0.3.4", "v0.5.0", "v1.0.0"],
        ));

        // Both wants must hold at once: >=0.3.0 from the project and
        // ~0.3.0 from the nested module (which arrives later and forces
        // a re-resolution over the union).
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.yaml"),
            "name: nested_constraint\nmodules:\n  - name: github.com/example/base\n    version: \"~0.3.0\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("base")).unwrap();
        std::fs::write(
            dir.path().join("base/manifest.yaml"),
            "name: github.com/example/base",
        )
        .unwrap();

        let fetcher = Arc::new(
            StaticRemote::new()
                .with_tree(
                    "https://github.com/example/base",
                    "v1.0.0",
                    dir.path().join("base"),
                )
                .with_tree(
                    "https://github.com/example/base",
                    "v0.3.4",
                    dir.path().join("base"),
                ),
        );

        let mut project = project(
            "testing-project",
            &[("github.com/example/base", Some(">=0.3.0")), ("nested_constraint", None)],
        );
        project.replacements.insert(
            "nested_constraint".into(),
            dir.path().display().to_string(),
        );

        let resolver = GraphResolver::new(remote, fetcher, PathBuf::from("."));
        let modules = resolver.resolve(&project).await.unwrap();
        let base = modules.iter().find(|m| m.name == "github.com/example/base").unwrap();
        assert_eq!(base.version.tag.as_deref(), Some("v0.3.4"));
    }

    #[tokio::test]
    async fn test_conflicting_wants_render_history_tree() {
        let remote = Arc::new(StaticRemote::new().with_refs(
            "https://github.com/example/base",
            &["v0.3.4", "v0.5.0"],
        ));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.yaml"),
            "name: nested_constraint\nmodules:\n  - name: github.com/example/base\n    version: \"~0.3.0\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("base")).unwrap();
        std::fs::write(
            dir.path().join("base/manifest.yaml"),
            "name: github.com/example/base",
        )
        .unwrap();

        let fetcher = Arc::new(StaticRemote::new().with_tree(
            "https://github.com/example/base",
            "v0.5.0",
            dir.path().join("base"),
        ));

        let mut project = project(
            "testing-project",
            &[("github.com/example/base", Some(">=0.5.0")), ("nested_constraint", None)],
        );
        project
            .replacements
            .insert("nested_constraint".into(), dir.path().display().to_string());

        let resolver = GraphResolver::new(remote, fetcher, PathBuf::from("."));
        let err = resolver.resolve(&project).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("testing-project (top-level) wants >=0.5.0"), "{message}");
        assert!(
            message.contains("  nested_constraint@virtual (source: local) wants ~0.3.0"),
            "{message}"
        );
        assert!(message.contains("no version"), "{message}");
    }

    #[test]
    fn test_render_history_indents_by_depth() {
        let history = vec![
            HistoryEntry {
                criterion: Criterion::parse_constraint(">=0.5.0").unwrap(),
                parent: "testing-project (top-level)".into(),
            },
            HistoryEntry {
                criterion: Criterion::parse_constraint("~0.3.0").unwrap(),
                parent: "nested_constraint@virtual (source: local)".into(),
            },
        ];

        assert_eq!(
            render_history(&history),
            "testing-project (top-level) wants >=0.5.0\n  nested_constraint@virtual (source: local) wants ~0.3.0"
        );
    }
}
