//! Scenario execution
//!
//! Runs scenarios through the process or console engine under the privilege
//! switcher and turns what happened into [`ScenarioReport`]s. Groups acquire
//! their resources first and run their scenarios one after another; separate
//! groups run concurrently up to the configured job count.

use std::time::Instant;

use futures_util::stream::{self, StreamExt};

use crate::common::config::HarnessConfig;
use crate::common::{Error, Result};

use super::console::{run_console, ConsoleTiming};
use super::environment::TestEnv;
use super::privilege::PrivilegeSwitcher;
use super::process::{argv, ProcessRunner, RunOptions};
use super::report::{Failure, GroupReport, ScenarioReport, SuiteReport};
use super::resources::{AcquireOptions, ResourceSet};
use super::scenario::{ExecutionResult, ExecutionState, RunFailure, Scenario};
use super::suite::{GroupSpec, SuiteFile};
use super::template::Vars;

/// A group whose resources are held and whose rows are expanded
pub struct PreparedGroup {
    /// Built scenarios in table order; rows that failed to expand keep their error
    pub scenarios: Vec<(String, Result<Scenario>)>,
    pub resources: ResourceSet,
}

/// Acquires a group's resources and expands its rows
pub struct GroupBuilder<'a> {
    group: &'a GroupSpec,
    vars: Vars,
    filter: Option<&'a str>,
}

impl<'a> GroupBuilder<'a> {
    pub fn new(group: &'a GroupSpec, vars: Vars) -> Self {
        Self {
            group,
            vars,
            filter: None,
        }
    }

    pub fn filter(mut self, filter: Option<&'a str>) -> Self {
        self.filter = filter;
        self
    }

    /// Acquire resources, then expand the selected rows against the result
    pub async fn build(mut self, options: &AcquireOptions) -> Result<PreparedGroup> {
        let resources = ResourceSet::acquire_all(&self.group.resources, &mut self.vars, options).await?;
        let scenarios = self
            .group
            .selected(self.filter)
            .map(|spec| (spec.name.clone(), spec.build(self.group, &self.vars)))
            .collect();
        Ok(PreparedGroup {
            scenarios,
            resources,
        })
    }
}

/// Executes scenarios against one CLI binary
pub struct ScenarioRunner<'a> {
    env: &'a TestEnv,
    config: &'a HarnessConfig,
    switcher: &'a PrivilegeSwitcher,
    process: ProcessRunner,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(env: &'a TestEnv, config: &'a HarnessConfig, switcher: &'a PrivilegeSwitcher) -> Self {
        Self {
            env,
            config,
            switcher,
            process: ProcessRunner::new(&env.cmd_path),
        }
    }

    fn run_options(&self, scenario: &Scenario) -> RunOptions {
        RunOptions {
            dir: scenario.dir.clone(),
            env: scenario.env.clone(),
            stdin: scenario.stdin.clone(),
            privileged: scenario.privileged,
            timeout: scenario
                .timeout
                .unwrap_or_else(|| self.config.timeouts.process()),
            drain_grace: self.config.timeouts.drain_grace(),
        }
    }

    /// Spawn the scenario's invocation and wait for it
    async fn invoke(&self, scenario: &Scenario) -> Result<ExecutionResult> {
        let options = self.run_options(scenario);

        if scenario.is_console() {
            let timing = ConsoleTiming {
                expect_timeout: self.config.timeouts.expect(),
                poll_interval: self.config.timeouts.poll_interval(),
            };
            run_console(
                self.process.program(),
                &argv(&scenario.command, &scenario.args),
                scenario.console_mode,
                &scenario.console,
                &options,
                timing,
            )
            .await
        } else {
            self.process
                .run(&scenario.command, &scenario.args, &options)
                .await
        }
    }

    /// Run one scenario and assert on its outcome
    pub async fn execute(&self, scenario: &Scenario) -> ScenarioReport {
        if scenario.requires_network && !self.env.run_disabled {
            return ScenarioReport::skipped(
                &scenario.name,
                "requires network access (set E2E_RUN_DISABLED=1 to run)",
            );
        }

        let started = Instant::now();
        let mut state = ExecutionState::Pending;
        tracing::debug!(
            scenario = %scenario.name,
            command = %scenario.command,
            args = ?scenario.args,
            privileged = scenario.privileged,
            "Running scenario"
        );

        let outcome = match self.switcher.acquire(scenario.privileged).await {
            Ok(guard) => {
                state = state.advance(ExecutionState::Running);
                let outcome = self.invoke(scenario).await;
                drop(guard);
                outcome
            }
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed();
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                state = state.advance(ExecutionState::SetupFailed);
                tracing::warn!(scenario = %scenario.name, error = %e, "Scenario could not start");
                let failure = match e {
                    Error::Spawn { .. } => Failure::Spawn {
                        message: e.to_string(),
                    },
                    other => Failure::Setup {
                        message: other.to_string(),
                    },
                };
                return ScenarioReport::failed(&scenario.name, state, elapsed, failure);
            }
        };

        match result.error.clone() {
            Some(RunFailure::TimedOut { after }) => {
                state = state.advance(ExecutionState::TimedOut);
                ScenarioReport::failed(&scenario.name, state, elapsed, Failure::Timeout { after, result })
            }
            Some(failure) => {
                state = state.advance(match failure {
                    RunFailure::ExpectTimedOut { .. } => ExecutionState::TimedOut,
                    _ => ExecutionState::Completed(result.exit_code),
                });
                ScenarioReport::failed(&scenario.name, state, elapsed, Failure::Console { failure, result })
            }
            None => {
                state = state.advance(ExecutionState::Completed(result.exit_code));
                match assert_outcome(scenario, result) {
                    None => ScenarioReport::passed(&scenario.name, state, elapsed),
                    Some(failure) => ScenarioReport::failed(&scenario.name, state, elapsed, failure),
                }
            }
        }
    }

    /// Acquire the group's resources and run its selected scenarios in order
    pub async fn run_group(&self, group: &GroupSpec, vars: Vars, filter: Option<&str>) -> GroupReport {
        let selected: Vec<_> = group.selected(filter).map(|s| s.name.clone()).collect();
        let mut report = GroupReport {
            name: group.name.clone(),
            scenarios: Vec::with_capacity(selected.len()),
            release_errors: Vec::new(),
        };
        if selected.is_empty() {
            return report;
        }

        let options = AcquireOptions {
            work_dir: self.env.test_dir.clone(),
            run: RunOptions {
                timeout: self.config.timeouts.process(),
                drain_grace: self.config.timeouts.drain_grace(),
                ..RunOptions::default()
            },
        };

        let prepared = {
            let _guard = match self.switcher.acquire(false).await {
                Ok(guard) => guard,
                Err(e) => {
                    report.scenarios = selected
                        .iter()
                        .map(|name| ScenarioReport::setup_failed(name, e.to_string()))
                        .collect();
                    return report;
                }
            };
            GroupBuilder::new(group, vars).filter(filter).build(&options).await
        };

        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(group = %group.name, error = %e, "Group setup failed");
                report.scenarios = selected
                    .iter()
                    .map(|name| ScenarioReport::setup_failed(name, e.to_string()))
                    .collect();
                return report;
            }
        };

        for (name, scenario) in &prepared.scenarios {
            let scenario_report = match scenario {
                Ok(scenario) => self.execute(scenario).await,
                Err(e) => ScenarioReport::setup_failed(name, e.to_string()),
            };
            tracing::debug!(
                group = %group.name,
                scenario = %name,
                status = ?scenario_report.status,
                "Scenario finished"
            );
            report.scenarios.push(scenario_report);
        }

        report.release_errors = prepared
            .resources
            .release()
            .into_iter()
            .map(|(name, e)| format!("failed to release '{name}': {e}"))
            .collect();
        report
    }

    /// Run every group, at most `jobs` at a time
    pub async fn run_suite(
        &self,
        suite: &SuiteFile,
        filter: Option<&str>,
        jobs: usize,
    ) -> Result<SuiteReport> {
        let started = Instant::now();
        let vars = Vars::for_environment(self.env)?;
        tracing::info!(suite = %suite.name, groups = suite.groups.len(), jobs, "Running suite");

        let groups = stream::iter(&suite.groups)
            .map(|group| self.run_group(group, vars.clone(), filter))
            .buffered(jobs.max(1))
            .filter(|report| std::future::ready(!report.scenarios.is_empty()))
            .collect::<Vec<_>>()
            .await;

        Ok(SuiteReport {
            name: suite.name.clone(),
            groups,
            duration: started.elapsed(),
        })
    }
}

/// Compare a completed execution with the scenario's expectations
fn assert_outcome(scenario: &Scenario, result: ExecutionResult) -> Option<Failure> {
    let exit_ok = result.exit_code == scenario.expect_exit;
    let missing_output = scenario
        .expect_output
        .as_ref()
        .filter(|output| !output.matches(&result))
        .cloned();

    if exit_ok && missing_output.is_none() {
        return None;
    }
    Some(Failure::Mismatch {
        expected_exit: scenario.expect_exit,
        actual_exit: result.exit_code,
        missing_output,
        result,
    })
}
