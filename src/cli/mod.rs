//! Command-line interface module.
//!
//! This module defines the CLI structure using Clap, including
//! all commands, arguments, and options.
//!
//! # Commands
//!
//! - `render`: Resolve modules and render the project
//! - `resolve`: Print the resolved module set without rendering
//! - `init`: Create a starter project manifest
//! - `validate`: Validate a project manifest
//!
//! # Example Usage
//!
//! ```bash
//! # Render the project in the current directory
//! stencil render
//!
//! # Render with block adoption for pre-existing files
//! stencil render --adopt
//!
//! # Show what modules a project resolves to
//! stencil resolve ./my-service
//!
//! # Initialize a project manifest
//! stencil init my-service
//!
//! # Validate a manifest
//! stencil validate stencil.yaml
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Stencil - living-template code generator.
#[derive(Parser, Debug)]
#[command(
    name = "stencil",
    author,
    version,
    about = "Living-template code generator",
    long_about = "Stencil renders source trees from versioned template modules and \
                  re-renders them over time while preserving user edits in named blocks."
)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve modules and render the project
    #[command(visible_alias = "r")]
    Render(RenderArgs),

    /// Print the resolved module set without rendering
    Resolve(ResolveArgs),

    /// Create a starter project manifest
    Init(InitArgs),

    /// Validate a project manifest
    Validate(ValidateArgs),
}

/// Arguments for the render command.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Project directory containing stencil.yaml
    #[arg(value_name = "DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Adopt pre-existing file content into template blocks
    #[arg(long)]
    pub adopt: bool,

    /// Pre-render iteration cap before giving up on convergence
    #[arg(long, value_name = "N", default_value_t = crate::render::DEFAULT_MAX_ITERATIONS)]
    pub max_iterations: usize,
}

/// Arguments for the resolve command.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Project directory containing stencil.yaml
    #[arg(value_name = "DIR", default_value = ".")]
    pub dir: PathBuf,
}

/// Arguments for the init command.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project name (must match ^[_a-z][_a-z0-9-]*$)
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Directory to create the manifest in
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub dir: PathBuf,
}

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the project manifest to validate
    #[arg(value_name = "FILE", default_value = "stencil.yaml")]
    pub manifest: PathBuf,
}
