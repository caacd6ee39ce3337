//! Webterm - run scripts and shells on this host from a browser.
//!
//! Usage:
//!   webterm serve [--port 8090] [--root DIR] [--file demo.py]

use clap::{Parser, Subcommand};
use std::process::exit;
use tracing_subscriber::EnvFilter;
use webterm::config::{Config, ServeArgs};
use webterm::http_server;
use webterm::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "webterm")]
#[command(about = "Browser-driven remote terminal")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve(ServeArgs),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let Some(Commands::Serve(serve)) = args.command else {
        eprintln!("Error: Use the 'serve' subcommand");
        exit(1);
    };
    init_tracing(serve.verbose);

    let config = match Config::from_args(&serve) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };
    if !config.auth_enabled() {
        tracing::warn!("No password configured; authentication is disabled");
    }

    if let Err(e) = http_server::run_server(serve.port, AppState::new(config)).await {
        eprintln!("Error: {}", e);
        exit(1);
    }
}
