//! Suite file types
//!
//! Defines the data structures for deserializing YAML suite files and
//! expanding their rows into [`Scenario`] values.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::common::{Error, Result};

use super::resources::ResourceSpec;
use super::scenario::{ConsoleMode, ConsoleOp, OutputMatch, OutputStream, Scenario, NETWORK_SCHEMES};
use super::template::Vars;

/// A complete suite loaded from a YAML file
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct SuiteFile {
    /// Name of the suite
    pub name: String,
    /// Optional description of what the suite covers
    pub description: Option<String>,
    /// Groups run independently of each other
    pub groups: Vec<GroupSpec>,
}

/// Scenarios sharing defaults and resources; run sequentially
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,
    pub description: Option<String>,
    /// Default CLI subcommand for the group's scenarios
    pub command: Option<String>,
    /// Default working directory
    pub dir: Option<String>,
    /// Default privilege level
    #[serde(default)]
    pub privileged: bool,
    /// Default console connection
    pub console_mode: Option<ConsoleMode>,
    /// Extra environment for every scenario
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Acquired in order before the first scenario, released after the last
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    pub scenarios: Vec<ScenarioSpec>,
}

/// Expected output: a bare substring of stdout, or a substring and stream
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum OutputSpec {
    Contains(String),
    Detailed {
        contains: String,
        #[serde(default)]
        stream: OutputStream,
    },
}

/// One row of a scenario table
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    pub name: String,
    /// Overrides the group command
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Expected exit code
    pub exit: i64,
    pub output: Option<OutputSpec>,
    #[serde(default)]
    pub console: Vec<ConsoleOp>,
    pub console_mode: Option<ConsoleMode>,
    /// Text fed to stdin
    pub stdin: Option<String>,
    pub privileged: Option<bool>,
    pub dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Timeout in seconds, overriding the configured process timeout
    pub timeout: Option<u64>,
    /// Overrides detection from network URIs in `args`
    pub requires_network: Option<bool>,
}

impl SuiteFile {
    /// Load and validate a suite file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content).map_err(|message| Error::SuiteParse {
            path: PathBuf::from(path),
            message,
        })
    }

    /// Parse and validate suite YAML
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let suite: SuiteFile = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
        suite.validate()?;
        Ok(suite)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut group_names = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err("group with an empty name".to_string());
            }
            if !group_names.insert(group.name.as_str()) {
                return Err(format!("duplicate group '{}'", group.name));
            }

            let mut resource_names = HashSet::new();
            for resource in &group.resources {
                let name = resource.name();
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(format!(
                        "group '{}': invalid resource name '{name}'",
                        group.name
                    ));
                }
                if !resource_names.insert(name) {
                    return Err(format!(
                        "group '{}': duplicate resource '{name}'",
                        group.name
                    ));
                }
            }

            for scenario in &group.scenarios {
                let at = format!("{}/{}", group.name, scenario.name);
                if !(0..=255).contains(&scenario.exit) {
                    return Err(format!(
                        "{at}: exit code {} is outside 0..=255",
                        scenario.exit
                    ));
                }
                if scenario.command.is_none() && group.command.is_none() {
                    return Err(format!("{at}: no command and the group has no default"));
                }
                if scenario.timeout == Some(0) {
                    return Err(format!("{at}: timeout must be at least one second"));
                }
                if !scenario.console.is_empty() && scenario.stdin.is_some() {
                    return Err(format!("{at}: console scripts and stdin are exclusive"));
                }
            }
        }
        Ok(())
    }

    /// Number of scenarios across all groups
    pub fn scenario_count(&self) -> usize {
        self.groups.iter().map(|g| g.scenarios.len()).sum()
    }
}

impl GroupSpec {
    /// Scenarios selected by `filter`
    pub fn selected<'a>(&'a self, filter: Option<&'a str>) -> impl Iterator<Item = &'a ScenarioSpec> {
        self.scenarios
            .iter()
            .filter(move |s| s.selected_by(&self.name, filter))
    }
}

impl ScenarioSpec {
    /// Whether `filter` matches `group/name`
    pub fn selected_by(&self, group: &str, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(f) => format!("{group}/{}", self.name).contains(f),
        }
    }

    /// Whether the row needs registry access, judged before expansion
    pub fn needs_network(&self) -> bool {
        self.requires_network.unwrap_or_else(|| {
            self.args
                .iter()
                .any(|a| NETWORK_SCHEMES.iter().any(|s| a.starts_with(s)))
        })
    }

    /// Expand this row against the group defaults and `vars`
    pub fn build(&self, group: &GroupSpec, vars: &Vars) -> Result<Scenario> {
        let command = self
            .command
            .as_deref()
            .or(group.command.as_deref())
            .ok_or_else(|| Error::Config(format!("scenario '{}' has no command", self.name)))?;

        let mut scenario = Scenario::new(&self.name, vars.expand(command)?, self.exit as i32)
            .args(vars.expand_all(&self.args)?)
            .privileged(self.privileged.unwrap_or(group.privileged));

        if let Some(mode) = self.console_mode.or(group.console_mode) {
            scenario = scenario.console_mode(mode);
        }
        if !self.console.is_empty() {
            let ops = self
                .console
                .iter()
                .map(|op| {
                    Ok(match op {
                        ConsoleOp::Expect(p) => ConsoleOp::Expect(vars.expand(p)?),
                        ConsoleOp::SendLine(t) => ConsoleOp::SendLine(vars.expand(t)?),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            scenario = scenario.console(ops);
        }
        if let Some(input) = &self.stdin {
            scenario = scenario.stdin(vars.expand(input)?);
        }
        if let Some(output) = &self.output {
            let (pattern, stream) = match output {
                OutputSpec::Contains(p) => (p, OutputStream::Stdout),
                OutputSpec::Detailed { contains, stream } => (contains, *stream),
            };
            scenario = scenario.expect_output(OutputMatch {
                pattern: vars.expand(pattern)?,
                stream,
            });
        }
        if let Some(dir) = self.dir.as_deref().or(group.dir.as_deref()) {
            scenario = scenario.dir(vars.expand(dir)?);
        }
        for (key, value) in group.env.iter().chain(self.env.iter()) {
            scenario = scenario.env(key, vars.expand(value)?);
        }
        if let Some(secs) = self.timeout {
            scenario = scenario.timeout(Duration::from_secs(secs));
        }
        if let Some(requires) = self.requires_network {
            scenario = scenario.requires_network(requires);
        }
        Ok(scenario)
    }
}
