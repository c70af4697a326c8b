//! agentflow CLI entrypoint

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agentflow::cli::Cli;
use agentflow::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins, then the settings file, then "info"
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = Settings::load()
            .ok()
            .and_then(|settings| settings.log_level)
            .unwrap_or_else(|| "info".to_string());
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    // Initialize tracing
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Parse and execute CLI
    let cli = Cli::parse();
    cli.execute().await
}
