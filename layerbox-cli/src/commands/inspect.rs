use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Build file, relative to the context, or inline content
    #[arg(short = 'f', long = "file", default_value = "Dockerfile")]
    pub file: String,

    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,
}

pub async fn execute(args: InspectArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let file = layerbox::parse(&args.file, &args.context)?;
    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}
