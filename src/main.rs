use anyhow::Result;
use clap::Parser;
use tracing::info;

use shellmux::server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = server::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting shellmux server");

    server::run_server(args).await
}
