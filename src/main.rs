//! scriptbox - run documentation snippets in per-session sandboxes.
//!
//! Usage:
//!   scriptbox serve [--port 8080] [--runner docker|kubernetes|local]

use std::process::exit;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use scriptbox::config::RunnerConfig;
use scriptbox::{http_server, sandbox, AppState};

#[derive(Parser, Debug)]
#[command(name = "scriptbox")]
#[command(about = "Run documentation snippets in disposable sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "8080")]
        port: u16,

        #[command(flatten)]
        runner: RunnerConfig,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match args.command {
        Commands::Serve { port, runner } => {
            let backend = match sandbox::connect(&runner).await {
                Ok(backend) => backend,
                Err(e) => {
                    error!("Failed to set up {:?} runner: {}", runner.runner, e);
                    exit(1);
                }
            };
            info!(runner = backend.name(), "Sandbox runner ready");

            let state = AppState::new(backend).with_wait_timeout(runner.wait_timeout());
            if let Err(e) = http_server::run_server(port, state).await {
                error!("Server failed: {}", e);
                exit(1);
            }
        }
    }
}
