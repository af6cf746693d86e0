//! VCS collaborator interfaces.
//!
//! The resolver and loader touch the outside world through two narrow
//! traits: [`RefLister`] (list remote refs once per URI) and
//! [`ModuleFetcher`] (materialise a module's tree at a resolved ref).
//! The default implementation shells out to `git`, caching clones under
//! the user cache directory so repeated runs avoid network round-trips.
//!
//! [`StaticRemote`] is an in-memory implementation of both traits used
//! by tests.

use crate::error::{Result, StencilError};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// A single remote ref, as reported by `git ls-remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    /// Commit SHA the ref points at
    pub commit: String,
    /// Full ref name (e.g. `refs/tags/v1.2.3`, `refs/heads/main`)
    pub name: String,
}

/// Lists remote refs for a module URI.
#[async_trait]
pub trait RefLister: Send + Sync {
    /// List every ref of the remote at `uri`.
    async fn list_remote_refs(&self, uri: &str) -> Result<Vec<RemoteRef>>;
}

/// Materialises a module's filesystem at a resolved ref.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    /// Fetch `uri` at `reference` and return a local directory holding
    /// the module's content.
    async fn fetch(&self, uri: &str, reference: &str) -> Result<PathBuf>;
}

/// Cache entry metadata stored in a `.stencil-cache` file inside each
/// cached clone.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CacheEntry {
    /// Original repository URI
    url: String,
    /// Ref that was checked out
    reference: String,
    /// Timestamp when the cache was last updated (Unix epoch seconds)
    last_updated: u64,
}

/// Git collaborator backed by the `git` binary.
///
/// Clones are shallow and cached per `(uri, ref)` under the user cache
/// directory; a cached tree is reused as-is since a tag or commit ref
/// never moves.
pub struct GitCli {
    cache_dir: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("stencil")
            .join("modules");
        Self { cache_dir }
    }
}

impl GitCli {
    /// Create a git collaborator with an explicit cache directory.
    #[must_use]
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Generate a cache key (directory name) for a URI + ref pair.
    fn cache_key(uri: &str, reference: &str) -> String {
        let readable = uri
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("module")
            .replace(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_', "-");

        let mut hasher = DefaultHasher::new();
        uri.hash(&mut hasher);
        reference.hash(&mut hasher);
        format!("{}-{:08x}", readable, hasher.finish() & 0xFFFF_FFFF)
    }

    /// Path a given `(uri, ref)` pair would be cached at.
    #[must_use]
    pub fn cache_path(&self, uri: &str, reference: &str) -> PathBuf {
        self.cache_dir.join(Self::cache_key(uri, reference))
    }

    async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| StencilError::Internal {
            message: format!("failed to spawn git: {e}"),
        })?;

        if !output.status.success() {
            return Err(StencilError::Internal {
                message: format!(
                    "git {} failed: {}",
                    args.first().copied().unwrap_or(""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write_cache_entry(path: &Path, uri: &str, reference: &str) -> Result<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let entry = CacheEntry {
            url: uri.to_string(),
            reference: reference.to_string(),
            last_updated: now,
        };

        let meta_path = path.join(".stencil-cache");
        let content = serde_json::to_string_pretty(&entry)?;
        tokio::fs::write(&meta_path, content)
            .await
            .map_err(|e| StencilError::io(&meta_path, e))?;
        Ok(())
    }
}

#[async_trait]
impl RefLister for GitCli {
    async fn list_remote_refs(&self, uri: &str) -> Result<Vec<RemoteRef>> {
        tracing::debug!(uri = %uri, "Listing remote refs");

        let stdout = Self::run_git(&["ls-remote", uri], None)
            .await
            .map_err(|e| StencilError::RemoteListFailed {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;

        let mut refs = Vec::new();
        for line in stdout.lines() {
            if let Some((commit, name)) = line.split_once('\t') {
                refs.push(RemoteRef {
                    commit: commit.trim().to_string(),
                    name: name.trim().to_string(),
                });
            }
        }

        tracing::debug!(uri = %uri, count = refs.len(), "Remote refs listed");
        Ok(refs)
    }
}

#[async_trait]
impl ModuleFetcher for GitCli {
    async fn fetch(&self, uri: &str, reference: &str) -> Result<PathBuf> {
        let target = self.cache_path(uri, reference);

        if target.join(".stencil-cache").exists() {
            tracing::debug!(uri = %uri, reference = %reference, "Module cache hit");
            return Ok(target);
        }

        if !self.cache_dir.exists() {
            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| StencilError::io(&self.cache_dir, e))?;
        }

        tracing::info!(uri = %uri, reference = %reference, "Cloning module");

        let target_str = target.display().to_string();
        Self::run_git(
            &["clone", "--depth", "1", "--branch", reference, uri, &target_str],
            None,
        )
        .await?;

        Self::write_cache_entry(&target, uri, reference).await?;
        Ok(target)
    }
}

/// In-memory remote for tests: a fixed set of refs per URI and an
/// optional local tree per `(uri, ref)` pair.
#[derive(Debug, Default)]
pub struct StaticRemote {
    refs: HashMap<String, Vec<RemoteRef>>,
    trees: HashMap<(String, String), PathBuf>,
}

impl StaticRemote {
    /// Create an empty static remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register refs for a URI. Shorthand names: a name starting with
    /// `refs/` is used verbatim, otherwise it is registered as a tag.
    #[must_use]
    pub fn with_refs(mut self, uri: &str, names: &[&str]) -> Self {
        let refs = names
            .iter()
            .enumerate()
            .map(|(i, name)| RemoteRef {
                commit: format!("{i:040x}"),
                name: if name.starts_with("refs/") {
                    (*name).to_string()
                } else {
                    format!("refs/tags/{name}")
                },
            })
            .collect();
        self.refs.insert(uri.to_string(), refs);
        self
    }

    /// Register a local tree for a `(uri, ref)` pair.
    #[must_use]
    pub fn with_tree(mut self, uri: &str, reference: &str, path: PathBuf) -> Self {
        self.trees.insert((uri.to_string(), reference.to_string()), path);
        self
    }
}

#[async_trait]
impl RefLister for StaticRemote {
    async fn list_remote_refs(&self, uri: &str) -> Result<Vec<RemoteRef>> {
        self.refs
            .get(uri)
            .cloned()
            .ok_or_else(|| StencilError::RemoteListFailed {
                uri: uri.to_string(),
                message: "unknown remote".to_string(),
            })
    }
}

#[async_trait]
impl ModuleFetcher for StaticRemote {
    async fn fetch(&self, uri: &str, reference: &str) -> Result<PathBuf> {
        self.trees
            .get(&(uri.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| StencilError::Internal {
                message: format!("no tree registered for {uri}@{reference}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_stable_and_readable() {
        let a = GitCli::cache_key("https://github.com/example/base", "v1.0.0");
        let b = GitCli::cache_key("https://github.com/example/base", "v1.0.0");
        assert_eq!(a, b);
        assert!(a.starts_with("base-"));
    }

    #[test]
    fn test_cache_key_distinguishes_refs() {
        let a = GitCli::cache_key("https://github.com/example/base", "v1.0.0");
        let b = GitCli::cache_key("https://github.com/example/base", "v1.1.0");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_static_remote_lists_registered_refs() {
        let remote = StaticRemote::new().with_refs(
            "https://github.com/example/base",
            &["v1.0.0", "refs/heads/main"],
        );

        let refs = remote
            .list_remote_refs("https://github.com/example/base")
            .await
            .unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "refs/tags/v1.0.0");
        assert_eq!(refs[1].name, "refs/heads/main");
    }

    #[tokio::test]
    async fn test_static_remote_unknown_uri_fails() {
        let remote = StaticRemote::new();
        assert!(remote.list_remote_refs("https://nowhere").await.is_err());
    }
}
