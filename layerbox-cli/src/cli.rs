use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use layerbox::BuilderOptions;

use crate::commands::{build, inspect, prune, pull};

/// layerbox - build images from Dockerfile-like files without a daemon
#[derive(Parser, Debug)]
#[command(name = "layerbox", author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a file into the layer store
    Build(build::BuildArgs),

    /// Pull a base image into the layer store
    Pull(pull::PullArgs),

    /// Remove layers not referenced by the given files
    Prune(prune::PruneArgs),

    /// Print a parsed file as JSON
    Inspect(inspect::InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Layer store directory
    #[arg(long, global = true, env = "LAYERBOX_LAYERS_DIR", value_name = "DIR")]
    pub layers_dir: Option<PathBuf>,

    /// Seconds a pulled base stays fresh (-1: never refresh, 0: always check)
    #[arg(
        long,
        global = true,
        env = "LAYERBOX_REGISTRY_TTL",
        allow_negative_numbers = true,
        value_name = "SECS"
    )]
    pub registry_ttl: Option<i64>,

    /// Registry API base URL
    #[arg(long, global = true, env = "LAYERBOX_REGISTRY_URL", value_name = "URL")]
    pub registry_url: Option<String>,

    /// Token service base URL
    #[arg(long, global = true, env = "LAYERBOX_AUTH_URL", value_name = "URL")]
    pub auth_url: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

impl GlobalFlags {
    /// Defaults overlaid with whatever was given on the command line.
    pub fn builder_options(&self) -> BuilderOptions {
        let mut options = BuilderOptions::default();
        if let Some(dir) = &self.layers_dir {
            options.layers_dir = dir.clone();
        }
        if let Some(ttl) = self.registry_ttl {
            options.registry.ttl_secs = ttl;
        }
        if let Some(url) = &self.registry_url {
            options.registry.api_base_url = url.clone();
        }
        if let Some(url) = &self.auth_url {
            options.registry.auth_base_url = url.clone();
        }
        options
    }
}
