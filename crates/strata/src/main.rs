use anyhow::Result;
use clap::Parser;

use strata::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing, so DATABASE_URL from .env reaches the arg parser.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    cli.execute().await
}
