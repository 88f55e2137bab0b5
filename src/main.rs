use tracing::info;
use tracing_subscriber::EnvFilter;

use cloud_scheduler::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Starting cloud scheduler");

    cli::run(cli).await
}
