//! Module filesystem views.
//!
//! Every module exposes its content through a [`ModuleFilesystem`]: an
//! in-memory tree (replacement modules, tests) or a local directory
//! (local replacements and materialised clones). All paths are relative
//! to the module root; traversal outside the root is rejected with
//! `CrossedBoundary`, which is what backs the `stencil.ReadFile` family
//! of template bindings.

use crate::error::{Result, StencilError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A file inside an in-memory module tree.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    /// Raw contents
    pub contents: Vec<u8>,
    /// Unix permission bits
    pub mode: u32,
    /// Modification time
    pub mtime: SystemTime,
}

/// A directory entry returned by [`ModuleFilesystem::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (single path segment)
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

/// A module's filesystem view, rooted at the module's content.
#[derive(Debug, Clone)]
pub enum ModuleFilesystem {
    /// In-memory tree: normalized relative path to file
    Memory(BTreeMap<String, MemoryFile>),
    /// Local directory (replacement path or materialised clone)
    Local {
        /// Module root on disk
        root: PathBuf,
    },
}

impl ModuleFilesystem {
    /// Create an empty in-memory filesystem.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(BTreeMap::new())
    }

    /// Create a view over a local directory.
    #[must_use]
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::Local { root: root.into() }
    }

    /// Add a file to an in-memory filesystem (builder style).
    ///
    /// # Panics
    ///
    /// Panics when called on a local filesystem view.
    #[must_use]
    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        match &mut self {
            Self::Memory(files) => {
                files.insert(
                    normalize(path).expect("invalid in-memory path"),
                    MemoryFile {
                        contents: contents.into(),
                        mode: 0o644,
                        mtime: SystemTime::UNIX_EPOCH,
                    },
                );
            }
            Self::Local { .. } => panic!("with_file is only supported on in-memory filesystems"),
        }
        self
    }

    /// Read a file's raw bytes.
    ///
    /// # Errors
    ///
    /// `CrossedBoundary` for paths escaping the root, an I/O error for
    /// missing or unreadable files.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let rel = normalize(path)?;
        match self {
            Self::Memory(files) => files
                .get(&rel)
                .map(|f| f.contents.clone())
                .ok_or_else(|| not_found(&rel)),
            Self::Local { root } => {
                let full = root.join(&rel);
                std::fs::read(&full).map_err(|e| StencilError::io(&full, e))
            }
        }
    }

    /// Read a file as UTF-8 text.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read), plus an error for non-UTF-8 content.
    pub fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|_| StencilError::Internal {
            message: format!("file '{path}' is not valid UTF-8"),
        })
    }

    /// Whether a file or directory exists at `path`.
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        let Ok(rel) = normalize(path) else { return false };
        match self {
            Self::Memory(files) => {
                let dir_prefix = format!("{rel}/");
                files.contains_key(&rel) || files.keys().any(|k| k.starts_with(&dir_prefix))
            }
            Self::Local { root } => root.join(&rel).exists(),
        }
    }

    /// List the entries of a directory.
    ///
    /// # Errors
    ///
    /// `CrossedBoundary` for escaping paths, an I/O error otherwise.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let rel = normalize(path)?;
        match self {
            Self::Memory(files) => {
                let prefix = if rel.is_empty() { String::new() } else { format!("{rel}/") };
                let mut entries: Vec<DirEntry> = Vec::new();
                for key in files.keys() {
                    let Some(rest) = key.strip_prefix(&prefix) else { continue };
                    let (name, is_dir) = match rest.split_once('/') {
                        Some((first, _)) => (first, true),
                        None => (rest, false),
                    };
                    if !entries.iter().any(|e| e.name == name) {
                        entries.push(DirEntry { name: name.to_string(), is_dir });
                    }
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            }
            Self::Local { root } => {
                let full = root.join(&rel);
                let mut entries = Vec::new();
                for entry in std::fs::read_dir(&full).map_err(|e| StencilError::io(&full, e))? {
                    let entry = entry.map_err(|e| StencilError::io(&full, e))?;
                    entries.push(DirEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        is_dir: entry.path().is_dir(),
                    });
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            }
        }
    }

    /// File metadata: unix mode bits and mtime. In-memory files report
    /// `0o644` and the epoch so renders stay deterministic.
    ///
    /// # Errors
    ///
    /// `CrossedBoundary` for escaping paths, an I/O error otherwise.
    pub fn metadata(&self, path: &str) -> Result<(u32, SystemTime)> {
        let rel = normalize(path)?;
        match self {
            Self::Memory(files) => files
                .get(&rel)
                .map(|f| (f.mode, f.mtime))
                .ok_or_else(|| not_found(&rel)),
            Self::Local { root } => {
                let full = root.join(&rel);
                let meta = std::fs::metadata(&full).map_err(|e| StencilError::io(&full, e))?;
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    meta.permissions().mode() & 0o777
                };
                #[cfg(not(unix))]
                let mode = 0o644;
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Ok((mode, mtime))
            }
        }
    }

    /// Recursively list every file under `path` (relative paths,
    /// sorted). Used by template discovery.
    ///
    /// # Errors
    ///
    /// `CrossedBoundary` for escaping paths, an I/O error otherwise.
    pub fn walk(&self, path: &str) -> Result<Vec<String>> {
        let rel = normalize(path)?;
        match self {
            Self::Memory(files) => {
                let prefix = if rel.is_empty() { String::new() } else { format!("{rel}/") };
                Ok(files
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect())
            }
            Self::Local { root } => {
                let full = root.join(&rel);
                if !full.exists() {
                    return Ok(Vec::new());
                }
                let mut out = Vec::new();
                for entry in walkdir::WalkDir::new(&full).sort_by_file_name() {
                    let entry = entry.map_err(|e| StencilError::Internal {
                        message: format!("walk failed under '{}': {e}", full.display()),
                    })?;
                    if entry.file_type().is_file() {
                        let rel_path = entry
                            .path()
                            .strip_prefix(root)
                            .unwrap_or(entry.path())
                            .to_string_lossy()
                            .replace('\\', "/");
                        out.push(rel_path);
                    }
                }
                Ok(out)
            }
        }
    }
}

fn not_found(path: &str) -> StencilError {
    StencilError::io(
        Path::new(path),
        std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
    )
}

/// Normalize a module-relative path, rejecting traversal outside the
/// module root.
fn normalize(path: &str) -> Result<String> {
    let cleaned = path.trim_start_matches("./");
    if cleaned.starts_with('/') || cleaned.contains('\\') {
        return Err(StencilError::CrossedBoundary { path: path.to_string() });
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in cleaned.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(StencilError::CrossedBoundary { path: path.to_string() });
                }
            }
            other => stack.push(other),
        }
    }
    Ok(stack.join("/"))
}
