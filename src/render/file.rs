//! The runtime representation of a rendered output file.

use std::collections::HashMap;
use std::time::SystemTime;

/// A single output file produced by a template.
///
/// Created fresh on every render pass. When `deleted` or `skipped` is
/// set, `contents` is never committed to disk.
#[derive(Debug, Clone)]
pub struct File {
    /// Output path, relative to the project root
    pub path: String,
    /// Unix permission bits
    pub mode: u32,
    /// Modification time to stamp on commit
    pub mtime: SystemTime,
    /// Rendered contents
    pub contents: Vec<u8>,
    /// User-edit blocks parsed from the existing target file
    pub blocks: HashMap<String, String>,
    /// Remove the target instead of writing it
    pub deleted: bool,
    /// Leave the target untouched
    pub skipped: bool,
    /// Why the file was skipped, for logs
    pub skip_reason: Option<String>,
    /// Non-fatal notes surfaced to the host
    pub warnings: Vec<String>,
    /// Whether contents were explicitly set during rendering
    pub contents_set: bool,
}

impl File {
    /// Create an empty file at `path` with the given defaults.
    #[must_use]
    pub fn new(path: impl Into<String>, mode: u32, mtime: SystemTime) -> Self {
        Self {
            path: path.into(),
            mode,
            mtime,
            contents: Vec::new(),
            blocks: HashMap::new(),
            deleted: false,
            skipped: false,
            skip_reason: None,
            warnings: Vec::new(),
            contents_set: false,
        }
    }

    /// The preserved contents of a named block, if the target file had
    /// one.
    #[must_use]
    pub fn block(&self, name: &str) -> Option<&str> {
        self.blocks.get(name).map(String::as_str)
    }

    /// Set the file's contents explicitly.
    pub fn set_contents(&mut self, contents: impl Into<Vec<u8>>) {
        self.contents = contents.into();
        self.contents_set = true;
    }

    /// Mark the file as skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skipped = true;
        self.skip_reason = Some(reason.into());
    }

    /// Mark the target for deletion.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    /// Whether this file should be written on commit.
    #[must_use]
    pub fn is_committable(&self) -> bool {
        !self.skipped && !self.deleted
    }
}
