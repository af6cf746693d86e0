//! Stencil CLI entry point.
//!
//! This binary provides the command-line interface for Stencil.

use clap::Parser;
use std::process::ExitCode;
use stencil::cli::{Cli, Commands};
use stencil::{ProjectManifest, RenderOptions, Stencil};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");

            eprintln!("Error: {e}");

            // Print error chain (cause chain)
            let mut causes = e.chain().skip(1).peekable();
            if causes.peek().is_some() {
                eprintln!("\nCaused by:");
                for (i, cause) in causes.enumerate() {
                    eprintln!("  {i}: {cause}");
                }
            }

            let exit_code = e
                .downcast_ref::<stencil::StencilError>()
                .map_or(1, stencil::StencilError::exit_code);
            ExitCode::from(u8::try_from(exit_code).unwrap_or(1))
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let base_level = match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            EnvFilter::new(format!("warn,stencil={base_level}"))
        })
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Render(args) => {
            tracing::debug!(dir = %args.dir.display(), "Executing render command");
            let stencil = Stencil::new(&args.dir).with_options(RenderOptions {
                adopt: args.adopt,
                max_iterations: args.max_iterations,
            });

            let run = stencil.run().await?;

            for path in &run.written {
                println!("  -> {path}");
            }
            for path in &run.removed {
                println!("  rm {path}");
            }
            println!(
                "Rendered {} templates ({} files written, {} removed)",
                run.templates.len(),
                run.written.len(),
                run.removed.len()
            );

            if !run.post_run_commands.is_empty() {
                println!("\nPost-run commands declared by modules:");
                for command in &run.post_run_commands {
                    println!("  {}: {}", command.name, command.command);
                }
            }

            Ok(ExitCode::from(0))
        }

        Commands::Resolve(args) => {
            let stencil = Stencil::new(&args.dir);
            let (project, modules) = stencil.resolve().await?;

            println!("{} resolves {} modules:", project.name, modules.len());
            for module in &modules {
                println!("  {} {} ({})", module.name, module.version, module.uri);
            }

            Ok(ExitCode::from(0))
        }

        Commands::Init(args) => {
            let manifest_path = args.dir.join("stencil.yaml");
            if manifest_path.exists() {
                anyhow::bail!("Project manifest already exists: {}", manifest_path.display());
            }

            let starter = format!(
                "name: {}\nmodules: []\n# modules:\n#   - name: github.com/example/base\n#     version: \">=1.0.0 <2.0.0\"\narguments: {{}}\n",
                args.name
            );
            // Validate the chosen name before writing anything.
            ProjectManifest::from_yaml(&starter)?;

            std::fs::write(&manifest_path, starter)?;
            println!("Created project manifest: {}", manifest_path.display());
            Ok(ExitCode::from(0))
        }

        Commands::Validate(args) => {
            let content = std::fs::read_to_string(&args.manifest)?;
            match ProjectManifest::from_yaml(&content) {
                Ok(manifest) => {
                    println!(
                        "Manifest is valid: {} ({} modules)",
                        manifest.name,
                        manifest.modules.len()
                    );
                    Ok(ExitCode::from(0))
                }
                Err(e) => {
                    eprintln!("Manifest error: {e}");
                    Ok(ExitCode::from(1))
                }
            }
        }
    }
}
