//! Version selection for a single module.
//!
//! Given a module URI and a set of [`Criterion`]s, the resolver picks
//! the single best matching version from the remote's refs:
//!
//! - semver tags, sorted by semver precedence, are preferred
//! - branches sort after all tags, by name
//! - a branch criterion dominates: a version on that branch satisfies
//!   every other non-branch criterion
//! - a pre-release is only eligible when some criterion names its track
//!
//! The remote ref list is fetched once per URI and memoized for the
//! resolver's lifetime.

use crate::error::{Result, StencilError};
use crate::vcs::RefLister;
use dashmap::DashMap;
use semver::Comparator;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Source of truth for a version that never came from a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualSource {
    /// Local directory replacement
    Local,
    /// In-memory replacement module
    InMemory,
    /// Other virtual filesystem
    Vfs,
}

impl fmt::Display for VirtualSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::InMemory => write!(f, "in-memory"),
            Self::Vfs => write!(f, "vfs"),
        }
    }
}

/// A resolved module version.
///
/// Exactly one of `tag`, `branch`, `virtual_source` identifies the
/// source of truth; `commit` is the canonical resolved identity for
/// remote versions (empty for virtual ones).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Commit SHA for remote versions
    pub commit: String,
    /// Tag name as written in the remote (e.g. `v1.2.3`)
    pub tag: Option<String>,
    /// Parsed semver for tag versions
    pub semver: Option<semver::Version>,
    /// Branch name for branch versions
    pub branch: Option<String>,
    /// Set for versions that never touched the remote
    pub virtual_source: Option<VirtualSource>,
}

impl Version {
    /// A tag version with its parsed semver.
    #[must_use]
    pub fn tag(commit: impl Into<String>, tag: impl Into<String>, semver: semver::Version) -> Self {
        Self {
            commit: commit.into(),
            tag: Some(tag.into()),
            semver: Some(semver),
            branch: None,
            virtual_source: None,
        }
    }

    /// A branch version.
    #[must_use]
    pub fn branch(commit: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            tag: None,
            semver: None,
            branch: Some(name.into()),
            virtual_source: None,
        }
    }

    /// A virtual version (local path or in-memory module).
    #[must_use]
    pub fn virtual_(source: VirtualSource) -> Self {
        Self {
            commit: String::new(),
            tag: None,
            semver: None,
            branch: None,
            virtual_source: Some(source),
        }
    }

    /// The git ref to fetch for this version (tag or branch name).
    #[must_use]
    pub fn git_ref(&self) -> Option<&str> {
        self.tag.as_deref().or(self.branch.as_deref())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tag) = &self.tag {
            write!(f, "{tag}")
        } else if let Some(branch) = &self.branch {
            write!(f, "{branch}")
        } else {
            write!(f, "virtual")
        }
    }
}

/// A single requirement over a module's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// A semver constraint: space-separated conjunction of comparators
    Constraint {
        /// The constraint as written
        raw: String,
        /// Parsed comparators, all of which must match
        comparators: Vec<Comparator>,
    },
    /// A branch requirement
    Branch(String),
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constraint { raw, .. } => write!(f, "{raw}"),
            Self::Branch(name) => write!(f, "branch {name}"),
        }
    }
}

impl Criterion {
    /// Parse a constraint string: a space-separated conjunction of
    /// semver comparators (e.g. `">=1.0.0 <2.0.0"`, `"~0.3.0"`).
    ///
    /// # Errors
    ///
    /// `ComplexConstraintNotSupported` for `||` / `&&`,
    /// `ConstraintParse` for anything that is not a comparator list.
    pub fn parse_constraint(raw: &str) -> Result<Self> {
        if raw.contains("||") || raw.contains("&&") {
            return Err(StencilError::ComplexConstraintNotSupported { constraint: raw.to_string() });
        }

        let comparators = raw
            .split_whitespace()
            .map(|part| {
                Comparator::from_str(part).map_err(|e| StencilError::ConstraintParse {
                    constraint: raw.to_string(),
                    message: format!("'{part}': {e}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if comparators.is_empty() {
            return Err(StencilError::ConstraintParse {
                constraint: raw.to_string(),
                message: "empty constraint".to_string(),
            });
        }

        Ok(Self::Constraint { raw: raw.to_string(), comparators })
    }

    /// Derive a criterion from a project or module version spec.
    ///
    /// Empty means any version; an exact semver version pins it; a
    /// parseable constraint is used as-is; anything else names a
    /// branch.
    ///
    /// # Errors
    ///
    /// `ComplexConstraintNotSupported` for `||` / `&&`.
    pub fn from_version_spec(spec: Option<&str>) -> Result<Self> {
        let spec = spec.unwrap_or("").trim();
        if spec.is_empty() {
            return Self::parse_constraint(">=0.0.0");
        }
        if spec.contains("||") || spec.contains("&&") {
            return Err(StencilError::ComplexConstraintNotSupported {
                constraint: spec.to_string(),
            });
        }

        let bare = spec.strip_prefix('v').unwrap_or(spec);
        if semver::Version::parse(bare).is_ok() {
            return Self::parse_constraint(&format!("={bare}"));
        }

        match Self::parse_constraint(spec) {
            Ok(criterion) => Ok(criterion),
            Err(_) => Ok(Self::Branch(spec.to_string())),
        }
    }

    /// The pre-release track this criterion names, if any (`rc` for
    /// `=1.23.1-rc.1`).
    #[must_use]
    pub fn prerelease_track(&self) -> Option<String> {
        let Self::Constraint { comparators, .. } = self else { return None };
        comparators
            .iter()
            .find(|c| !c.pre.is_empty())
            .and_then(|c| c.pre.as_str().split('.').next().map(str::to_string))
    }
}

/// Resolves the best version of a module URI against a set of criteria,
/// memoizing the remote's ref list per URI.
pub struct VersionResolver {
    lister: Arc<dyn RefLister>,
    memo: DashMap<String, Arc<Vec<Version>>>,
}

impl VersionResolver {
    /// Create a resolver over the given ref-listing collaborator.
    #[must_use]
    pub fn new(lister: Arc<dyn RefLister>) -> Self {
        Self { lister, memo: DashMap::new() }
    }

    /// Resolve the single best version of `uri` satisfying every
    /// criterion.
    ///
    /// # Errors
    ///
    /// `MultipleBranches` / `MultiplePrereleases` for conflicting
    /// criteria, `NoVersions` when nothing matches, `RemoteListFailed`
    /// when the remote cannot be listed.
    pub async fn resolve(&self, uri: &str, criteria: &[Criterion]) -> Result<Version> {
        debug_assert!(!criteria.is_empty(), "resolve requires at least one criterion");

        let branch = required_branch(uri, criteria)?;
        let track = allowed_track(uri, criteria)?;

        let versions = self.versions_for(uri).await?;
        let winner = versions.iter().find(|v| {
            if let Some(branch) = &branch {
                // Branch dominance: a version on the requested branch
                // satisfies every other criterion.
                return v.branch.as_deref() == Some(branch.as_str());
            }
            let Some(semver) = &v.semver else { return false };
            criteria.iter().all(|c| match c {
                Criterion::Branch(_) => unreachable!("handled by branch dominance"),
                Criterion::Constraint { comparators, .. } => comparators
                    .iter()
                    .all(|comp| comparator_matches(comp, semver, track.as_deref())),
            })
        });

        match winner {
            Some(version) => {
                tracing::debug!(uri = %uri, version = %version, "Resolved version");
                Ok(version.clone())
            }
            None => Err(StencilError::NoVersions { uri: uri.to_string() }),
        }
    }

    /// The sorted version list for `uri`, fetched once.
    async fn versions_for(&self, uri: &str) -> Result<Arc<Vec<Version>>> {
        if let Some(cached) = self.memo.get(uri) {
            return Ok(Arc::clone(&cached));
        }

        let refs = self.lister.list_remote_refs(uri).await?;
        let mut versions: Vec<Version> = Vec::new();
        for remote_ref in refs {
            // Peeled variants point at the same object as the tag itself.
            if remote_ref.name.ends_with("^{}") {
                continue;
            }
            if let Some(tag) = remote_ref.name.strip_prefix("refs/tags/") {
                let bare = tag.strip_prefix('v').unwrap_or(tag);
                if let Ok(parsed) = semver::Version::parse(bare) {
                    versions.push(Version::tag(remote_ref.commit, tag, parsed));
                }
            } else if let Some(branch) = remote_ref.name.strip_prefix("refs/heads/") {
                versions.push(Version::branch(remote_ref.commit, branch));
            }
        }

        versions.sort_by(|a, b| match (&a.semver, &b.semver) {
            // Tags sort before branches, descending by semver precedence.
            (Some(va), Some(vb)) => vb.cmp(va),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.branch.cmp(&b.branch),
        });

        let versions = Arc::new(versions);
        self.memo.insert(uri.to_string(), Arc::clone(&versions));
        Ok(versions)
    }
}

/// The one branch the criteria agree on, if any.
fn required_branch(uri: &str, criteria: &[Criterion]) -> Result<Option<String>> {
    let mut branch: Option<&str> = None;
    for criterion in criteria {
        if let Criterion::Branch(name) = criterion {
            match branch {
                None => branch = Some(name),
                Some(existing) if existing == name => {}
                Some(existing) => {
                    return Err(StencilError::MultipleBranches {
                        uri: uri.to_string(),
                        first: existing.to_string(),
                        second: name.clone(),
                    });
                }
            }
        }
    }
    Ok(branch.map(str::to_string))
}

/// The one pre-release track the criteria agree on, if any.
fn allowed_track(uri: &str, criteria: &[Criterion]) -> Result<Option<String>> {
    let mut track: Option<String> = None;
    for criterion in criteria {
        if let Some(named) = criterion.prerelease_track() {
            match &track {
                None => track = Some(named),
                Some(existing) if *existing == named => {}
                Some(existing) => {
                    return Err(StencilError::MultiplePrereleases {
                        uri: uri.to_string(),
                        first: existing.clone(),
                        second: named,
                    });
                }
            }
        }
    }
    Ok(track)
}

/// Comparator matching with pre-release track extension: once a
/// criterion names a track, comparators without a pre-release
/// qualifier are extended to permit versions on that track.
fn comparator_matches(c: &Comparator, v: &semver::Version, track: Option<&str>) -> bool {
    if v.pre.is_empty() {
        return c.matches(v);
    }
    let Some(track) = track else { return false };
    if v.pre.as_str().split('.').next() != Some(track) {
        return false;
    }
    if c.pre.is_empty() {
        c.matches(&semver::Version::new(v.major, v.minor, v.patch))
    } else {
        c.matches(v)
    }
}
