use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "scenariodb")]
#[command(about = "Inspect and clean cached test databases and snapshots", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List cached databases and snapshots with size and validity
    List,
    /// Remove cached databases and snapshots
    Remove {
        /// Only remove artifacts built from other sources than the current checkout
        #[arg(long)]
        stale_only: bool,
    },
}
