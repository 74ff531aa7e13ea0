//! Tether - LSP client multiplexer CLI
//!
//! Starts a language server, runs the handshake and sends requests through
//! the client core. All output is JSON.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether::cli::output::{error_json, print_json};
use tether::cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    // Quiet by default so stdout stays machine readable
    // Use RUST_LOG=tether=debug (or --verbose) for more
    let default_filter = if cli.verbose { "tether=debug" } else { "tether=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            print_json(&error_json(&format!("Failed to create runtime: {e}")));
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(cli)) {
        print_json(&error_json(&format!("{e:#}")));
        std::process::exit(2);
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    use tether::cli::commands;

    let config = commands::load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Probe(args) => commands::probe::execute(args, config).await,
        Commands::Request(args) => commands::request::execute(args, config).await,
    }
}
