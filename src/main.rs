//! trackmesh - peer-to-peer mesh node for content-addressed media
//!
//! `trackmesh start` runs a node; the other subcommands talk to a running
//! node over its local HTTP API.

mod commands;

use clap::Parser;
use std::error::Error;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trackmesh_core::{run_node, Cli, Commands, Config};

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Commands::Start(cmd) => {
            let config = Config::from_start_command(cmd)?;

            // Initialize logging
            init_logging(&config.log_level);

            tracing::info!("Starting trackmesh node...");
            run_node(config).await?;
        }
        command => {
            init_logging("warn");
            commands::run(command).await?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
