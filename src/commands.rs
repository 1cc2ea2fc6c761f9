//! CLI command definitions
//!
//! Defines the clap commands for the conformance harness.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scenarios of a suite file against the CLI in E2E_CMD_PATH
    Run {
        /// Path to the YAML suite file
        path: PathBuf,

        /// Only run scenarios whose "group/name" contains this text
        #[arg(long, short)]
        filter: Option<String>,

        /// Number of groups allowed to run at the same time
        #[arg(long, short)]
        jobs: Option<usize>,

        /// Per-invocation timeout in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        /// Per-expect timeout in seconds for console scripts
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        expect_timeout: Option<u64>,

        /// Alternative configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also write the full trace to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Verbose output, including captured streams of failures
        #[arg(long, short)]
        verbose: bool,
    },

    /// List the scenarios of a suite file without running them
    List {
        /// Path to the YAML suite file
        path: PathBuf,

        /// Only list scenarios whose "group/name" contains this text
        #[arg(long, short)]
        filter: Option<String>,
    },

    /// Show the suite environment as the harness resolves it
    Env {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    /// Whether the command asked for debug logging
    pub fn verbose(&self) -> bool {
        matches!(self, Commands::Run { verbose: true, .. })
    }

    /// Log file requested on the command line
    pub fn log_file(&self) -> Option<&PathBuf> {
        match self {
            Commands::Run { log_file, .. } => log_file.as_ref(),
            _ => None,
        }
    }
}
