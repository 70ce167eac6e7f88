use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tract_gapfill::config::AppConfig;
use tract_gapfill::pipeline;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pipeline configuration
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Running with config: {:?}", cli.config);
    let app_config = AppConfig::load_from_file(&cli.config)?;

    let output = pipeline::run(&app_config).await?;

    info!(
        "Done: {} units, {} gaps in measured data, {} imputed, {} still missing",
        output.dataset.len(),
        output.merge.reference_only.len(),
        output.imputation.filled(),
        output.imputation.unresolved.len()
    );
    if !output.imputation.unresolved.is_empty() {
        info!("Still missing: {}", output.imputation.unresolved.join(", "));
    }
    info!("Map written to {:?}", output.render.html);

    Ok(())
}
