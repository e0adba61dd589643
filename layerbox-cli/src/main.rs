mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // Namespaces must be entered while the process is still single threaded.
    if matches!(cli.command, Commands::Build(_))
        && let Some(code) = namespaces::enter()?
    {
        return Ok(code);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(cli))?;
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let global = &cli.global;
    match cli.command {
        Commands::Build(args) => commands::build::execute(args, global).await,
        Commands::Pull(args) => commands::pull::execute(args, global).await,
        Commands::Prune(args) => commands::prune::execute(args, global).await,
        Commands::Inspect(args) => commands::inspect::execute(args, global).await,
    }
}

#[cfg(target_os = "linux")]
mod namespaces {
    use std::process::ExitCode;
    use std::time::Duration;

    use anyhow::Context;
    use layerbox::SandboxError;
    use layerbox::constants::sandbox::ID_MAP_TIMEOUT_SECS;
    use layerbox::sandbox::{host_id_mapper, reexec_namespaced};
    use tracing::debug;

    /// Re-exec into build namespaces.
    ///
    /// `None` in the namespaced child, which carries on with the build.
    /// `Some(code)` in the parent once the child is gone.
    pub fn enter() -> anyhow::Result<Option<ExitCode>> {
        let mapper = host_id_mapper();
        let timeout = Duration::from_secs(ID_MAP_TIMEOUT_SECS);
        match reexec_namespaced("build", mapper.as_ref(), timeout) {
            Ok(Some(_)) => Ok(None),
            Ok(None) => Ok(Some(ExitCode::SUCCESS)),
            // The child already reported its own error.
            Err(SandboxError::ChildExited { code }) => {
                debug!(code, "namespaced build failed");
                Ok(Some(ExitCode::from(code.clamp(1, 255) as u8)))
            }
            Err(e) => Err(e).context("failed to enter build namespaces"),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod namespaces {
    pub fn enter() -> anyhow::Result<Option<std::process::ExitCode>> {
        Ok(None)
    }
}
