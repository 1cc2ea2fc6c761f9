//! CLI command handling
//!
//! Dispatches CLI commands to the harness and formats output.

use std::path::Path;

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::HarnessConfig;
use crate::common::{paths, Error, Result};
use crate::harness::{PrivilegeSwitcher, ScenarioRunner, SuiteFile, TestEnv};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            path,
            filter,
            jobs,
            timeout,
            expect_timeout,
            config,
            json,
            verbose,
            log_file: _,
        } => {
            // root stays in the saved ids for privileged scenarios
            if let Some(creds) = PrivilegeSwitcher::drop_to_invoking_user()? {
                tracing::debug!(?creds, "Running as invoking user");
            }

            let env = TestEnv::from_env()?;
            std::fs::create_dir_all(&env.test_dir).map_err(|e| {
                Error::Config(format!(
                    "cannot create test directory '{}': {e}",
                    env.test_dir.display()
                ))
            })?;

            let mut config = load_config(config.as_deref())?;
            if let Some(secs) = timeout {
                config.timeouts.process_secs = secs;
            }
            if let Some(secs) = expect_timeout {
                config.timeouts.expect_secs = secs;
            }
            if let Some(jobs) = jobs {
                config.runner.jobs = jobs;
            }

            let suite = SuiteFile::load(&path)?;
            let switcher = PrivilegeSwitcher::new()?;
            let runner = ScenarioRunner::new(&env, &config, &switcher);
            let report = runner
                .run_suite(&suite, filter.as_deref(), config.runner.jobs)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print(verbose);
            }

            if report.success() {
                Ok(())
            } else {
                Err(Error::TestAssertion(format!(
                    "{} of {} scenarios failed",
                    report.failed(),
                    report.total() - report.skipped()
                )))
            }
        }

        Commands::List { path, filter } => {
            let suite = SuiteFile::load(&path)?;

            println!("{} {}", "Suite:".blue().bold(), suite.name.white().bold());
            if let Some(desc) = &suite.description {
                println!("  {}", desc.dimmed());
            }

            let mut listed = 0;
            for group in &suite.groups {
                let rows: Vec<_> = group.selected(filter.as_deref()).collect();
                if rows.is_empty() {
                    continue;
                }
                println!("\n{}", format!("{}:", group.name).cyan());
                for row in rows {
                    let command = row
                        .command
                        .as_deref()
                        .or(group.command.as_deref())
                        .unwrap_or_default();
                    let mut tags = Vec::new();
                    if row.privileged.unwrap_or(group.privileged) {
                        tags.push("privileged");
                    }
                    if !row.console.is_empty() {
                        tags.push("console");
                    }
                    if row.needs_network() {
                        tags.push("network");
                    }
                    let tags = if tags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", tags.join(", "))
                    };
                    println!(
                        "  {} {} {} -> exit {}{}",
                        row.name,
                        command.dimmed(),
                        row.args.join(" ").dimmed(),
                        row.exit,
                        tags.yellow()
                    );
                    listed += 1;
                }
            }
            println!("\n{listed} of {} scenarios", suite.scenario_count());
            Ok(())
        }

        Commands::Env { json } => {
            let env = TestEnv::from_env()?;
            let config_path = paths::config_path();

            if json {
                let value = serde_json::json!({
                    "environment": env,
                    "config_path": config_path,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("E2E_CMD_PATH      {}", env.cmd_path.display());
                println!("E2E_TEST_DIR      {}", env.test_dir.display());
                println!("E2E_IMAGE_PATH    {}", env.image_path.display());
                println!("E2E_RUN_DISABLED  {}", env.run_disabled);
                match config_path {
                    Some(p) => println!("config            {}", p.display()),
                    None => println!("config            {}", "(no config directory)".dimmed()),
                }
            }
            Ok(())
        }
    }
}

/// Load the configuration file given on the command line, or the default one
fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => HarnessConfig::load_from(path),
        None => HarnessConfig::load(),
    }
}
