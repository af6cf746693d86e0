//! Project and module manifests.
//!
//! This module handles loading and validating the YAML manifests that
//! drive a render:
//!
//! - `stencil.yaml` (or `service.yaml`): the project manifest
//! - `manifest.yaml`: one per template module
//! - `stencil.lock`: the lockfile recording committed files and modules
//!
//! # Project Manifest Format
//!
//! ```yaml
//! name: my-service
//! modules:
//!   - name: github.com/example/base
//!     version: ">=1.0.0 <2.0.0"
//! arguments:
//!   serviceName: my-service
//!   deploy.replicas: 3
//! replacements:
//!   github.com/example/base: ../base
//! versions:
//!   terraform: "1.4.6"
//! ```

use crate::error::{Result, StencilError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Pattern every project name must match.
static PROJECT_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[_a-z][_a-z0-9-]*$").expect("Invalid regex"));

/// Manifest file names probed when loading a project.
pub const PROJECT_MANIFEST_NAMES: &[&str] = &["stencil.yaml", "service.yaml"];

/// A single module dependency entry (`{name, version}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDependency {
    /// Import path of the module (e.g. `github.com/example/base`)
    pub name: String,

    /// Version spec: semver version, constraint, branch or tag.
    /// Empty or absent means "any version".
    #[serde(default)]
    pub version: Option<String>,
}

/// The top-level project manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectManifest {
    /// Project name, matching `^[_a-z][_a-z0-9-]*$`
    pub name: String,

    /// Direct module dependencies, in declaration order
    pub modules: Vec<ModuleDependency>,

    /// Free-form arguments: dotted-path key to arbitrary YAML value
    pub arguments: HashMap<String, serde_json::Value>,

    /// Module replacements: import path to local path or URL
    pub replacements: HashMap<String, String>,

    /// Pinned tool versions (opaque to the renderer, exposed to templates)
    pub versions: HashMap<String, String>,
}

impl ProjectManifest {
    /// Parse a project manifest from YAML and validate it.
    ///
    /// # Errors
    ///
    /// Returns `ManifestParse` on malformed YAML and `InvalidProjectName`
    /// when the name does not match the required pattern.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(content)
            .map_err(|e| StencilError::manifest_parse("stencil.yaml", e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a project manifest from a directory, probing the known
    /// manifest file names.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when no manifest file exists, or a parse /
    /// validation error for a malformed one.
    pub fn load(dir: &Path) -> Result<Self> {
        for name in PROJECT_MANIFEST_NAMES {
            let path = dir.join(name);
            if path.exists() {
                tracing::debug!(path = %path.display(), "Loading project manifest");
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| StencilError::io(&path, e))?;
                let manifest: Self = serde_yaml::from_str(&content)
                    .map_err(|e| StencilError::manifest_parse(&path, e.to_string()))?;
                manifest.validate()?;
                return Ok(manifest);
            }
        }
        Err(StencilError::io(
            dir.join(PROJECT_MANIFEST_NAMES[0]),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no project manifest found"),
        ))
    }

    /// Validate manifest invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidProjectName` when the name does not match
    /// `^[_a-z][_a-z0-9-]*$`.
    pub fn validate(&self) -> Result<()> {
        if !PROJECT_NAME_PATTERN.is_match(&self.name) {
            return Err(StencilError::InvalidProjectName { name: self.name.clone() });
        }
        Ok(())
    }
}

/// A declared module argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Argument {
    /// Human-readable description
    pub description: String,

    /// Whether the project must supply a value
    pub required: bool,

    /// Default value used when the project supplies none
    pub default: Option<serde_json::Value>,

    /// JSON Schema (Draft-7) the supplied value must satisfy
    pub schema: Option<serde_json::Value>,

    /// Defer to another module's declaration of the same argument
    pub from: Option<String>,
}

/// A declared module hook, optionally schema-validated on append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleHookDecl {
    /// JSON Schema every appended value must satisfy
    pub schema: Option<serde_json::Value>,
}

/// A post-run command declaration. Execution is the host's concern;
/// the renderer only parses and surfaces these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRunCommand {
    /// Display name for logs
    pub name: String,

    /// Shell command line
    pub command: String,
}

/// What a module provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// The module ships templates under `templates/`
    Templates,
    /// The module ships a native extension
    Extension,
}

/// The set of types a module declares. Empty is equivalent to
/// `{templates}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleTypeSet(pub Vec<ModuleType>);

impl ModuleTypeSet {
    /// Whether this module contributes templates.
    #[must_use]
    pub fn has_templates(&self) -> bool {
        self.0.is_empty() || self.0.contains(&ModuleType::Templates)
    }

    /// Whether this module ships a native extension.
    #[must_use]
    pub fn has_extension(&self) -> bool {
        self.0.contains(&ModuleType::Extension)
    }
}

impl<'de> Deserialize<'de> for ModuleTypeSet {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accepts "templates", "extension", "both", or a list of types.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<ModuleType>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Many(types) => Ok(Self(types)),
            Raw::One(s) => match s.as_str() {
                "templates" => Ok(Self(vec![ModuleType::Templates])),
                "extension" => Ok(Self(vec![ModuleType::Extension])),
                "both" => Ok(Self(vec![ModuleType::Templates, ModuleType::Extension])),
                other => Err(serde::de::Error::custom(format!(
                    "unknown module type '{other}' (expected templates, extension or both)"
                ))),
            },
        }
    }
}

/// A module's `manifest.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleManifest {
    /// Module name; must equal the import path it was resolved under
    pub name: String,

    /// Transitive module dependencies
    pub modules: Vec<ModuleDependency>,

    /// What this module provides (defaults to `{templates}`)
    #[serde(rename = "type")]
    pub module_type: ModuleTypeSet,

    /// Declared arguments: dotted path to declaration
    pub arguments: HashMap<String, Argument>,

    /// Directory replacements: source path segment to template string.
    /// The rendered replacement must not contain a path separator.
    #[serde(rename = "dirReplacements")]
    pub dir_replacements: HashMap<String, String>,

    /// Declared module hooks
    #[serde(rename = "moduleHooks")]
    pub module_hooks: HashMap<String, ModuleHookDecl>,

    /// Commands the host should run after a successful render
    #[serde(rename = "postRunCommand")]
    pub post_run_commands: Vec<PostRunCommand>,
}

impl ModuleManifest {
    /// Parse a module manifest from YAML.
    ///
    /// # Errors
    ///
    /// Returns `ManifestParse` on malformed YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| StencilError::manifest_parse("manifest.yaml", e.to_string()))
    }
}

// =============================================================================
// Lockfile
// =============================================================================

/// A module entry in the lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockfileModule {
    /// Module import path
    pub name: String,
    /// Resolved URI
    pub url: String,
    /// Resolved version (tag, branch or virtual)
    pub version: String,
}

/// A file entry in the lockfile, one per committed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockfileFile {
    /// Path of the committed file, relative to the project root
    pub name: String,
    /// Import path of the template that produced it
    pub template: String,
    /// Module owning that template
    pub module: String,
}

/// The lockfile written next to the project manifest after a commit.
///
/// Consulted by `file.Once` (skip when the path is present) and
/// `file.Delete` (drop the matching entry).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lockfile {
    /// Generator version that produced this lockfile
    pub version: String,

    /// When the lockfile was generated
    pub generated: Option<DateTime<Utc>>,

    /// Resolved modules
    pub modules: Vec<LockfileModule>,

    /// Committed files
    pub files: Vec<LockfileFile>,
}

/// File name of the lockfile.
pub const LOCKFILE_NAME: &str = "stencil.lock";

impl Lockfile {
    /// Load the lockfile from a project directory; absent is not an error.
    ///
    /// # Errors
    ///
    /// Returns `ManifestParse` when the file exists but is malformed.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(LOCKFILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StencilError::io(&path, e))?;
        let lockfile = serde_yaml::from_str(&content)
            .map_err(|e| StencilError::manifest_parse(&path, e.to_string()))?;
        Ok(Some(lockfile))
    }

    /// Whether a committed-file entry exists for `path`.
    #[must_use]
    pub fn has_file(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.name == path)
    }

    /// Remove the committed-file entry for `path`, if any.
    pub fn remove_file(&mut self, path: &str) {
        self.files.retain(|f| f.name != path);
    }

    /// Serialize to YAML with entries sorted for stable diffs.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        let mut sorted = self.clone();
        sorted.modules.sort_by(|a, b| a.name.cmp(&b.name));
        sorted.files.sort_by(|a, b| a.name.cmp(&b.name));
        serde_yaml::to_string(&sorted)
            .map_err(|e| StencilError::internal(format!("failed to serialize lockfile: {e}")))
    }

    /// Write the lockfile into `dir`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when writing fails.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(LOCKFILE_NAME);
        std::fs::write(&path, self.to_yaml()?).map_err(|e| StencilError::io(&path, e))?;
        tracing::debug!(path = %path.display(), "Lockfile written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_parse_project_manifest() {
        let manifest = ProjectManifest::from_yaml(
            r#"
name: testing-project
modules:
  - name: github.com/example/base
    version: ">=0.5.0"
  - name: github.com/example/extra
arguments:
  serviceName: svc
  deploy.replicas: 3
replacements:
  github.com/example/base: ../base
"#,
        )
        .unwrap();

        assert_eq!(manifest.name, "testing-project");
        assert_eq!(manifest.modules.len(), 2);
        assert_eq!(manifest.modules[0].version.as_deref(), Some(">=0.5.0"));
        assert_eq!(manifest.modules[1].version, None);
        assert_eq!(
            manifest.arguments.get("deploy.replicas"),
            Some(&serde_json::json!(3))
        );
        assert_eq!(
            manifest.replacements.get("github.com/example/base"),
            Some(&"../base".to_string())
        );
    }

    #[test_case("MyService" ; "upper case")]
    #[test_case("1service" ; "leading digit")]
    #[test_case("svc.name" ; "dotted")]
    #[test_case("" ; "empty")]
    fn test_invalid_project_names_rejected(name: &str) {
        let yaml = format!("name: \"{name}\"");
        assert!(
            ProjectManifest::from_yaml(&yaml).is_err(),
            "name '{name}' should be rejected"
        );
    }

    #[test_case("service" ; "plain")]
    #[test_case("_svc" ; "leading underscore")]
    #[test_case("my-service-2" ; "dashes and digits")]
    fn test_valid_project_names_accepted(name: &str) {
        let yaml = format!("name: {name}");
        assert!(ProjectManifest::from_yaml(&yaml).is_ok());
    }

    #[test]
    fn test_parse_module_manifest() {
        let manifest = ModuleManifest::from_yaml(
            r#"
name: github.com/example/base
modules:
  - name: github.com/example/nested
    version: "~0.3.0"
type: templates
arguments:
  serviceName:
    description: Name of the service
    required: true
    schema:
      type: string
  replicas:
    default: 1
  name:
    from: github.com/example/nested
dirReplacements:
  appname: '{{ stencil.Arg("serviceName") }}'
moduleHooks:
  greetings:
    schema:
      type: string
postRunCommand:
  - name: format
    command: make fmt
"#,
        )
        .unwrap();

        assert_eq!(manifest.name, "github.com/example/base");
        assert!(manifest.module_type.has_templates());
        assert!(!manifest.module_type.has_extension());
        assert!(manifest.arguments["serviceName"].required);
        assert_eq!(
            manifest.arguments["name"].from.as_deref(),
            Some("github.com/example/nested")
        );
        assert!(manifest.module_hooks.contains_key("greetings"));
        assert_eq!(manifest.post_run_commands[0].name, "format");
    }

    #[test]
    fn test_module_type_forms() {
        let both = ModuleManifest::from_yaml("name: m\ntype: both").unwrap();
        assert!(both.module_type.has_templates());
        assert!(both.module_type.has_extension());

        let ext = ModuleManifest::from_yaml("name: m\ntype: extension").unwrap();
        assert!(!ext.module_type.has_templates());
        assert!(ext.module_type.has_extension());

        let list = ModuleManifest::from_yaml("name: m\ntype: [templates, extension]").unwrap();
        assert!(list.module_type.has_templates());
        assert!(list.module_type.has_extension());

        // Absent type defaults to templates.
        let default = ModuleManifest::from_yaml("name: m").unwrap();
        assert!(default.module_type.has_templates());
        assert!(!default.module_type.has_extension());
    }

    #[test]
    fn test_lockfile_sorts_on_write() {
        let lockfile = Lockfile {
            version: "0.4.0".into(),
            generated: None,
            modules: vec![
                LockfileModule { name: "b".into(), url: "https://b".into(), version: "v1.0.0".into() },
                LockfileModule { name: "a".into(), url: "https://a".into(), version: "v2.0.0".into() },
            ],
            files: vec![
                LockfileFile { name: "z.txt".into(), template: "t".into(), module: "m".into() },
                LockfileFile { name: "a.txt".into(), template: "t".into(), module: "m".into() },
            ],
        };

        let yaml = lockfile.to_yaml().unwrap();
        let a = yaml.find("name: a.txt").unwrap();
        let z = yaml.find("name: z.txt").unwrap();
        assert!(a < z, "file entries should be sorted by name");
    }

    #[test]
    fn test_lockfile_once_and_delete_helpers() {
        let mut lockfile = Lockfile {
            files: vec![LockfileFile {
                name: "config/app.yaml".into(),
                template: "base/templates/app.yaml.tpl".into(),
                module: "github.com/example/base".into(),
            }],
            ..Lockfile::default()
        };

        assert!(lockfile.has_file("config/app.yaml"));
        lockfile.remove_file("config/app.yaml");
        assert!(!lockfile.has_file("config/app.yaml"));
    }
}
