use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use imageserver::cli::Cli;
use imageserver::{ConnectionServer, XpaNotifier};

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;
    init_tracing(settings.verbose);

    let server = match ConnectionServer::bind(settings).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!(
                "{} starting imageserver, is it already running? {:#}",
                "ERROR".red().bold(),
                e
            );
            std::process::exit(1);
        }
    };
    let server = server.with_notifier(Arc::new(XpaNotifier::new()));

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, no longer accepting connections");
            token.cancel();
        }
    });

    server.run().await
}
