//! The runtime representation of a single template.

use crate::render::file::File;
use std::time::SystemTime;

/// A single template file discovered in a module.
///
/// Created at discovery, parsed into its module's environment at the
/// parse phase, and re-executed once per render pass. `files` holds
/// the outputs of the final pass only; pre-render outputs are
/// discarded.
#[derive(Debug)]
pub struct Template {
    /// Name of the owning module
    pub module: String,
    /// Path relative to the module root (e.g. `templates/app.yaml.tpl`)
    pub path: String,
    /// Raw template bytes
    pub contents: Vec<u8>,
    /// File mode, used as the default for outputs
    pub mode: u32,
    /// Modification time, used as the default for outputs
    pub mtime: SystemTime,
    /// Set iff the path ends with `.library.tpl`
    pub library: bool,
    /// Set iff the path ends with `.nontpl`
    pub binary: bool,
    /// Output files of the final render pass
    pub files: Vec<File>,
}

impl Template {
    /// Create a template from its discovery data, deriving the
    /// `library` / `binary` flags from the path.
    #[must_use]
    pub fn new(
        module: &str,
        path: &str,
        contents: Vec<u8>,
        mode: u32,
        mtime: SystemTime,
    ) -> Self {
        Self {
            module: module.to_string(),
            path: path.to_string(),
            contents,
            mode,
            mtime,
            library: path.ends_with(".library.tpl"),
            binary: path.ends_with(".nontpl"),
            files: Vec::new(),
        }
    }

    /// The module-qualified import path this template is registered
    /// under in its module's parse tree.
    #[must_use]
    pub fn import_path(&self) -> String {
        format!("{}/{}", self.module, self.path)
    }

    /// The default output path: the template path with the
    /// `templates/` root and the `.tpl` / `.nontpl` extension
    /// stripped. Directory replacements are applied later, by the
    /// renderer.
    #[must_use]
    pub fn default_output_path(&self) -> String {
        let path = self.path.strip_prefix("templates/").unwrap_or(&self.path);
        path.strip_suffix(".tpl")
            .or_else(|| path.strip_suffix(".nontpl"))
            .unwrap_or(path)
            .to_string()
    }

    /// Template source as UTF-8 text (binary templates have no text
    /// form).
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        if self.binary {
            return None;
        }
        std::str::from_utf8(&self.contents).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn template(path: &str) -> Template {
        Template::new("github.com/example/base", path, Vec::new(), 0o644, SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_flags_from_extension() {
        assert!(!template("templates/app.yaml.tpl").library);
        assert!(template("templates/helpers.library.tpl").library);
        assert!(template("templates/logo.png.nontpl").binary);
    }

    #[test]
    fn test_default_output_path_strips_root_and_extension() {
        assert_eq!(template("templates/virtual-file.tpl").default_output_path(), "virtual-file");
        assert_eq!(
            template("templates/cmd/main.go.tpl").default_output_path(),
            "cmd/main.go"
        );
        assert_eq!(template("templates/logo.png.nontpl").default_output_path(), "logo.png");
    }

    #[test]
    fn test_import_path_is_module_qualified() {
        assert_eq!(
            template("templates/app.yaml.tpl").import_path(),
            "github.com/example/base/templates/app.yaml.tpl"
        );
    }
}
