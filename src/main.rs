mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::Serve(args) => tidefetch::api::run(config, args.address).await?,
        Commands::Enqueue(args) => cli::enqueue(&config, args)?,
        Commands::List(args) => cli::list(&config, args)?,
        Commands::Purge(args) => cli::purge(&config, args)?,
        Commands::Migrate => cli::migrate(&config)?,
    }

    Ok(())
}
