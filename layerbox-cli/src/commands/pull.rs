use std::path::Path;

use anyhow::Context;
use clap::Args;
use layerbox::hash::hash_strings;
use layerbox::{DockerRegistry, Registry};
use tracing::debug;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference, e.g. alpine:3.20
    pub image: String,
}

pub async fn execute(args: PullArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let options = global.builder_options();
    let registry = DockerRegistry::new(&options.registry)?;

    // Same directory a build with `FROM <image>` uses.
    let image = args.image.trim();
    let dir = options.layers_dir.join(hash_strings(&[image]));
    std::fs::create_dir_all(&options.layers_dir)
        .with_context(|| format!("Failed to create {}", options.layers_dir.display()))?;

    debug!(image, dir = %dir.display(), registry = %options.registry.api_base_url, "Pulling");
    let changed = registry.pull(image, &dir).await?;
    report(image, &dir, changed);
    Ok(())
}

fn report(image: &str, dir: &Path, changed: bool) {
    let state = if changed { "pulled" } else { "up to date" };
    println!("{}: {} ({})", image, state, dir.display());
}
