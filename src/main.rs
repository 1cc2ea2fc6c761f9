//! Conformance harness CLI
//!
//! Runs YAML scenario suites against the container CLI named by
//! `E2E_CMD_PATH` and reports which scenarios diverged.

use clap::Parser;
use commands::Commands;
use conformance::common::logging;
use conformance::{cli, commands};

#[derive(Parser)]
#[command(name = "conformance", about = "Scenario-driven CLI conformance harness")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; the guard flushes the log file on exit
    let guard = match cli.command.log_file() {
        Some(path) => match logging::init_with_file(cli.command.verbose(), path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Error: cannot open log file '{}': {e}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            logging::init_cli(cli.command.verbose());
            None
        }
    };

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        drop(guard);
        std::process::exit(1);
    }
}
