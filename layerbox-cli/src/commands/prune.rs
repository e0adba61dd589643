use std::path::PathBuf;

use clap::Args;
use layerbox::builder::prune_layers;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Build file whose layers are kept, with its context
    #[arg(short = 'f', long = "file", value_name = "FILE[:CTX]")]
    pub files: Vec<String>,

    /// Allow removing every layer when no file is given
    #[arg(short, long)]
    pub all: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: PruneArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    if args.files.is_empty() && !args.all {
        anyhow::bail!("no file given; pass --all to remove every layer");
    }

    let referenced = args.files.iter().map(|f| split_file_arg(f)).collect::<Vec<_>>();
    let options = global.builder_options();
    debug!(
        layers_dir = %options.layers_dir.display(),
        referenced = referenced.len(),
        "Pruning layer store"
    );
    let stats = prune_layers(&options.layers_dir, &referenced)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for id in &stats.removed {
            println!("{}", id);
        }
        info!(kept = stats.kept, removed = stats.removed.len(), "Prune finished");
    }
    Ok(())
}

/// `FILE:CTX`, with the context defaulting to the current directory.
fn split_file_arg(arg: &str) -> (String, PathBuf) {
    match arg.rsplit_once(':') {
        Some((file, ctx)) if !file.is_empty() && !ctx.is_empty() => {
            (file.to_string(), PathBuf::from(ctx))
        }
        _ => (arg.to_string(), PathBuf::from(".")),
    }
}
