use clap::Parser;
use std::process;
use tracing::error;

use ftsched::cli::{Cli, CliHandler, Commands};
use ftsched::{logging, Config};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let handler = CliHandler::new(config);
    let result = match cli.command {
        Commands::Demo {
            members,
            timers,
            kill,
            buddy,
        } => handler.run_demo(members, timers, kill, buddy).await,
        Commands::Config => handler.print_config(),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}
