mod cache;
mod commands;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use commands::{Cli, Commands};
use scenariodb_core::{BuildConfig, BuildServices, ScenarioHasher};
use tracing_subscriber::EnvFilter;

use crate::cache::Inventory;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let Some(command) = args.command else {
        Cli::command().print_long_help()?;
        return Ok(());
    };

    let config = BuildConfig::load().context("loading configuration")?;
    let services = BuildServices::from_config(&config)?;
    let hashes = match ScenarioHasher::new().compute_hashes(&config) {
        Ok(hashes) => Some(hashes),
        Err(e) => {
            tracing::warn!("Could not hash the current checkout, validity is unknown: {}", e);
            None
        }
    };
    let inventory = Inventory::collect(&config, &services, hashes.as_ref()).await?;

    match command {
        Commands::List => {
            print!("{}", inventory.render().await);
        }
        Commands::Remove { stale_only } => {
            if stale_only && hashes.is_none() {
                bail!("--stale-only needs readable hash paths to tell stale from current artifacts");
            }
            let removed = inventory.remove(stale_only).await;
            println!("Removed {removed} artifact(s) of connection \"{}\"", config.connection);
        }
    }

    Ok(())
}
