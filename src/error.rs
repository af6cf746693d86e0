//! Error types for Stencil.
//!
//! This module defines the error hierarchy using `thiserror`. All errors
//! carry context (file, module, line) and propagate with the `?` operator.
//!
//! # Error Categories
//!
//! - **Configuration errors**: manifest parsing, invalid names, unknown arguments
//! - **Resolution errors**: no matching version, branch/prerelease conflicts
//! - **Block errors**: malformed user-edit block markers in existing files
//! - **Render errors**: template execution, schema violations, unstable state
//! - **I/O errors**: file system and subprocess failures

use std::path::PathBuf;
use thiserror::Error;

/// A specialized Result type for Stencil operations.
pub type Result<T> = std::result::Result<T, StencilError>;

/// The main error type for Stencil.
#[derive(Error, Debug)]
pub enum StencilError {
    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// I/O error with path context.
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// The path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A template attempted to read outside its module's filesystem.
    #[error("path '{path}' crosses the module filesystem boundary")]
    CrossedBoundary {
        /// The offending path
        path: String,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Manifest parsing error (project or module manifest).
    #[error("failed to parse manifest '{path}': {message}")]
    ManifestParse {
        /// The manifest file path
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Project name does not match the required pattern.
    #[error("invalid project name '{name}': must match ^[_a-z][_a-z0-9-]*$")]
    InvalidProjectName {
        /// The offending name
        name: String,
    },

    /// Module manifest name differs from its import path.
    #[error("module manifest name '{manifest_name}' does not match import path '{import_path}'")]
    ModuleNameMismatch {
        /// Name declared in manifest.yaml
        manifest_name: String,
        /// Import path the module was resolved under
        import_path: String,
    },

    /// A template referenced an argument its module does not declare.
    #[error("module '{module}' does not declare argument '{name}'")]
    UnknownArgument {
        /// The invoking module
        module: String,
        /// The undeclared argument path
        name: String,
    },

    /// An argument uses `from` to point at a module the declaring module
    /// does not list as a dependency.
    #[error("argument '{name}' in module '{module}' comes from '{from}', which is not a declared dependency")]
    ArgumentFromUndeclared {
        /// The declaring module
        module: String,
        /// The argument path
        name: String,
        /// The `from` target
        from: String,
    },

    /// A required argument was not supplied and has no default.
    #[error("argument '{name}' is required by module '{module}' but was not supplied")]
    MissingRequiredArgument {
        /// The declaring module
        module: String,
        /// The argument path
        name: String,
    },

    // =========================================================================
    // Version and Constraint Errors
    // =========================================================================
    /// Version parsing error.
    #[error("failed to parse version '{version}': {source}")]
    VersionParse {
        /// The version string that failed to parse
        version: String,
        /// The underlying semver error
        #[source]
        source: semver::Error,
    },

    /// Invalid constraint syntax.
    #[error("invalid version constraint '{constraint}': {message}")]
    ConstraintParse {
        /// The constraint string that failed to parse
        constraint: String,
        /// Error message
        message: String,
    },

    /// Constraint uses disjunction or boolean-and, which are unsupported.
    #[error("complex constraint '{constraint}' is not supported (no '||' or '&&')")]
    ComplexConstraintNotSupported {
        /// The offending constraint string
        constraint: String,
    },

    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// No version satisfied the given criteria.
    #[error("no version of '{uri}' satisfies the given criteria")]
    NoVersions {
        /// The module URI
        uri: String,
    },

    /// Two different branches were requested for the same module.
    #[error("conflicting branch criteria for '{uri}': '{first}' and '{second}'")]
    MultipleBranches {
        /// The module URI
        uri: String,
        /// The first branch requested
        first: String,
        /// The second branch requested
        second: String,
    },

    /// Two different pre-release tracks were requested for the same module.
    #[error("conflicting pre-release tracks for '{uri}': '{first}' and '{second}'")]
    MultiplePrereleases {
        /// The module URI
        uri: String,
        /// The first track requested
        first: String,
        /// The second track requested
        second: String,
    },

    /// Listing remote refs failed.
    #[error("failed to list remote versions of '{uri}': {message}\n  hint: ensure your git credentials grant read access to this repository")]
    RemoteListFailed {
        /// The module URI
        uri: String,
        /// Error message from the VCS collaborator
        message: String,
    },

    /// Resolution failed; carries the rendered constraint-history tree.
    #[error("failed to resolve module '{module}':\n{history}\n{source}")]
    Resolution {
        /// The module that failed to resolve
        module: String,
        /// Rendered constraint-history tree naming each ancestor's wants
        history: String,
        /// The underlying resolution error
        #[source]
        source: Box<StencilError>,
    },

    // =========================================================================
    // Block Parsing Errors
    // =========================================================================
    /// A block was still open at end of input.
    #[error("block '{name}' in '{file}' was never closed")]
    DanglingBlock {
        /// The unclosed block name
        name: String,
        /// The file being parsed
        file: String,
    },

    /// A closing marker appeared outside of any block.
    #[error("{file}:{line}: end-block marker without a matching open block")]
    DanglingEndBlock {
        /// The file being parsed
        file: String,
        /// Line of the stray marker
        line: usize,
    },

    /// A block opened inside another block.
    #[error("{file}:{line}: block '{name}' opened inside block '{current}'")]
    InvalidNestedBlock {
        /// The inner block name
        name: String,
        /// The block already open
        current: String,
        /// The file being parsed
        file: String,
        /// Line of the nested open marker
        line: usize,
    },

    /// A closing marker named a different block than the one open.
    #[error("{file}:{line}: end of block '{name}' does not match open block '{current}'")]
    InvalidEndBlock {
        /// The name in the closing marker
        name: String,
        /// The block currently open
        current: String,
        /// The file being parsed
        file: String,
        /// Line of the mismatched marker
        line: usize,
    },

    /// v2 marker syntax used with legacy `EndBlock` semantics.
    #[error("{file}:{line}: '<<Stencil::EndBlock>>' mixes legacy and v2 syntax; close blocks with '<</Stencil::Block>>'")]
    LegacyEndBlockV2Mix {
        /// The file being parsed
        file: String,
        /// Line of the offending marker
        line: usize,
    },

    // =========================================================================
    // Render Errors
    // =========================================================================
    /// Template parse error, annotated with module and import path.
    #[error("failed to parse template '{path}' in module '{module}': {message}")]
    TemplateParse {
        /// The owning module
        module: String,
        /// The template's import path
        path: String,
        /// Parser message
        message: String,
    },

    /// Template execution error.
    #[error("failed to render template '{path}': {message}")]
    Render {
        /// The template's import path
        path: String,
        /// Execution error message
        message: String,
    },

    /// A value failed JSON-schema validation.
    #[error("schema validation failed for {subject}: {message}")]
    SchemaValidation {
        /// What was being validated (e.g. `base.arguments.name`)
        subject: String,
        /// Collapsed validation errors with JSON pointers
        message: String,
    },

    /// Shared state failed to reach a fixed point within the iteration cap.
    #[error("shared state did not stabilise after {iterations} render passes")]
    UnstableSharedState {
        /// Number of pre-render passes executed
        iterations: usize,
    },

    /// A function name was exported more than once.
    #[error("function '{name}' is already exported by template '{existing}'")]
    AlreadyExported {
        /// The module-qualified function name
        name: String,
        /// The template that exported it first
        existing: String,
    },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Internal error (should not happen in normal operation).
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl StencilError {
    /// Creates an `Io` error.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Creates a `ManifestParse` error.
    #[must_use]
    pub fn manifest_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ManifestParse { path: path.into(), message: message.into() }
    }

    /// Creates a `Render` error.
    #[must_use]
    pub fn render(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render { path: path.into(), message: message.into() }
    }

    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns the appropriate exit code for the error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => 13,
            Self::ManifestParse { .. }
            | Self::InvalidProjectName { .. }
            | Self::ModuleNameMismatch { .. } => 18,
            Self::UnknownArgument { .. }
            | Self::ArgumentFromUndeclared { .. }
            | Self::MissingRequiredArgument { .. } => 19,
            Self::NoVersions { .. }
            | Self::MultipleBranches { .. }
            | Self::MultiplePrereleases { .. }
            | Self::ComplexConstraintNotSupported { .. }
            | Self::RemoteListFailed { .. }
            | Self::Resolution { .. } => 20,
            Self::DanglingBlock { .. }
            | Self::DanglingEndBlock { .. }
            | Self::InvalidNestedBlock { .. }
            | Self::InvalidEndBlock { .. }
            | Self::LegacyEndBlockV2Mix { .. } => 21,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for StencilError {
    fn from(source: std::io::Error) -> Self {
        // Prefer StencilError::io(path, source) where a path is known.
        Self::Io { path: PathBuf::new(), source }
    }
}

impl From<serde_json::Error> for StencilError {
    fn from(source: serde_json::Error) -> Self {
        Self::Internal { message: format!("JSON serialization error: {source}") }
    }
}
