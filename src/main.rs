use clap::Parser;
use proctrace::cli::{commands, Cli};
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Failed to set tracing subscriber: {}", e);
        process::exit(1);
    }

    info!("Starting proctrace v{}", proctrace::VERSION);

    let result = match cli.command {
        Some(command) => commands::handle_command(command).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
