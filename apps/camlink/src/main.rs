//! camlink entry point.

mod capture;
mod commands;
mod config;
mod connectors;
mod fetch;
mod serve;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Serial camera link: device daemon and download client.
#[derive(Parser)]
#[command(name = "camlink", version, about)]
struct Cli {
    /// Configuration file (default: ~/.config/camlink/camlink.toml).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device side: answer commands and serve downloads.
    Serve,
    /// Download one photo from a device.
    Fetch {
        /// File name on the device.
        name: String,

        /// Directory the photo is written to.
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting camlink");

    let config = config::Config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        match cli.command {
            Commands::Serve => serve::run(config).await,
            Commands::Fetch { name, out } => {
                let (path, record) = fetch::run(&config, &name, &out).await?;
                tracing::info!(path = %path.display(), "download complete");
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
        }
    });

    // A blocking serial read may still be parked on the blocking pool.
    rt.shutdown_timeout(Duration::from_secs(1));

    if result.is_ok() {
        tracing::info!("camlink shut down cleanly");
    }
    result
}
