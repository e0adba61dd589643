use std::path::PathBuf;

use clap::Args;
use comfy_table::{ContentArrangement, Table};
use layerbox::BuildSummary;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build file, relative to the context, or inline content
    #[arg(short = 'f', long = "file", default_value = "Dockerfile")]
    pub file: String,

    /// Rebuild every layer, ignoring cache markers
    #[arg(long)]
    pub force: bool,

    /// Bind mount for every RUN step
    #[arg(short = 'v', long = "volume", value_name = "SRC[:DST[:ro|rw]]")]
    pub volumes: Vec<String>,

    /// Print the build summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,
}

#[cfg(target_os = "linux")]
pub async fn execute(args: BuildArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    for volume in &args.volumes {
        layerbox::sandbox::BindSpec::parse(volume)?;
    }

    let file = layerbox::parse(&args.file, &args.context)?;
    let mut options = global.builder_options();
    options.force = args.force;
    options.mounts = args.volumes;

    debug!(
        context = %args.context.display(),
        layers_dir = %options.layers_dir.display(),
        force = options.force,
        mounts = options.mounts.len(),
        "Building"
    );
    let builder = layerbox::Builder::from_options(&options)?;
    let summary = builder.build(&file, None).await?;
    info!(
        layers = summary.layers.len(),
        rebuilt = summary.rebuilt(),
        "Build finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub async fn execute(_args: BuildArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    anyhow::bail!("build needs Linux namespaces and overlayfs")
}

fn print_summary(summary: &BuildSummary) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(["LAYER", "KIND", "STATUS"]);

    let base_status = if summary.base_changed { "pulled" } else { "cached" };
    table.add_row([short_id(&summary.base_id), "FROM", base_status]);
    for layer in &summary.layers {
        let status = if layer.changed { "built" } else { "cached" };
        table.add_row([short_id(&layer.id), layer.kind.as_str(), status]);
    }
    println!("{table}");
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
