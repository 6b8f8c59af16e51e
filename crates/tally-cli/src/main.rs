//! Tally CLI - operational entry point for the sync core
//!
//! Runs the sync server over an in-memory demo store, or tails a running
//! server as a client. The persistent store and the real command handlers
//! live in the application; this binary wires the core together for local
//! development and smoke testing.

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "tally")]
#[command(author = "Tally Contributors")]
#[command(version)]
#[command(about = "Real-time sync server for Tally", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server with an in-memory demo store
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "9470")]
        port: u16,

        /// Headless mode: bind to 0.0.0.0 for remote access
        #[arg(long)]
        headless: bool,
    },

    /// Connect to a running server and print every pushed frame
    Watch {
        /// WebSocket URL of the server
        #[arg(default_value = "ws://127.0.0.1:9470")]
        url: String,

        /// Session token passed on the upgrade request
        #[arg(short, long, default_value = "local")]
        token: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let result = match cli.command {
        Commands::Serve { port, headless } => commands::serve(port, headless).await,
        Commands::Watch { url, token } => commands::watch(&url, &token).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
