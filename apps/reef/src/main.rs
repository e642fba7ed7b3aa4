use anyhow::Result;
use clap::Parser;
use reef_client_core::cli::{self, Cli};
use reef_client_core::telemetry::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    cli::app::run(cli).await?;
    Ok(())
}
