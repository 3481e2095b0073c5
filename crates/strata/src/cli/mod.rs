mod migrate;

pub use migrate::{MigrateAction, MigrateCommand};

use anyhow::Result;
use clap::{Parser, Subcommand};

/// strata - schema migrations for PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage database migrations.
    Migrate(MigrateCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Migrate(cmd) => cmd.execute().await,
        }
    }
}
