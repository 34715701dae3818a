use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = fairdraw_cli::cli::Cli::parse();
    cli.run().await
}
