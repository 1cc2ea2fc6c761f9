//! Suite environment
//!
//! Reads the `E2E_*` variables once at suite start. The resulting [`TestEnv`]
//! is passed by reference to everything that needs it.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::common::{Error, Result};

/// Path (or bare name) of the CLI binary under test
pub const CMD_PATH_VAR: &str = "E2E_CMD_PATH";
/// Directory for scenario-created artifacts
pub const TEST_DIR_VAR: &str = "E2E_TEST_DIR";
/// Reference image used by most scenarios
pub const IMAGE_PATH_VAR: &str = "E2E_IMAGE_PATH";
/// Enables scenarios that need network or registry access
pub const RUN_DISABLED_VAR: &str = "E2E_RUN_DISABLED";

/// Typed suite environment
#[derive(Debug, Clone, Serialize)]
pub struct TestEnv {
    /// Resolved CLI binary
    pub cmd_path: PathBuf,
    /// Test working directory
    pub test_dir: PathBuf,
    /// Reference image artifact
    pub image_path: PathBuf,
    /// Run scenarios that are normally disabled (network / registry access)
    pub run_disabled: bool,
}

impl TestEnv {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup function
    ///
    /// Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let required = |var: &str| {
            get(var).ok_or_else(|| Error::EnvMissing {
                var: var.to_string(),
            })
        };

        let cmd_path = resolve_cmd_path(&required(CMD_PATH_VAR)?)?;
        let test_dir = PathBuf::from(required(TEST_DIR_VAR)?);
        let image_path = PathBuf::from(required(IMAGE_PATH_VAR)?);
        let run_disabled = match get(RUN_DISABLED_VAR) {
            Some(value) => parse_bool(RUN_DISABLED_VAR, &value)?,
            None => false,
        };

        tracing::debug!(
            cmd_path = %cmd_path.display(),
            test_dir = %test_dir.display(),
            image_path = %image_path.display(),
            run_disabled,
            "Loaded test environment"
        );

        Ok(Self {
            cmd_path,
            test_dir,
            image_path,
            run_disabled,
        })
    }
}

/// Resolve a bare command name through `PATH`; paths are taken as given
fn resolve_cmd_path(value: &str) -> Result<PathBuf> {
    let path = Path::new(value);
    if path.components().count() > 1 || path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    which::which(value)
        .map_err(|e| Error::env_invalid(CMD_PATH_VAR, value, &format!("not found in PATH: {e}")))
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::env_invalid(var, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_loads_all_fields() {
        let env = TestEnv::from_lookup(lookup(&[
            (CMD_PATH_VAR, "/usr/local/bin/singularity"),
            (TEST_DIR_VAR, "/tmp/e2e"),
            (IMAGE_PATH_VAR, "/tmp/e2e/test.sif"),
            (RUN_DISABLED_VAR, "yes"),
        ]))
        .unwrap();

        assert_eq!(env.cmd_path, PathBuf::from("/usr/local/bin/singularity"));
        assert_eq!(env.test_dir, PathBuf::from("/tmp/e2e"));
        assert_eq!(env.image_path, PathBuf::from("/tmp/e2e/test.sif"));
        assert!(env.run_disabled);
    }

    #[test]
    fn test_run_disabled_defaults_to_false() {
        let env = TestEnv::from_lookup(lookup(&[
            (CMD_PATH_VAR, "/bin/true"),
            (TEST_DIR_VAR, "/tmp"),
            (IMAGE_PATH_VAR, "/tmp/img.sif"),
        ]))
        .unwrap();
        assert!(!env.run_disabled);
    }

    #[test]
    fn test_missing_variable_is_fatal() {
        let err = TestEnv::from_lookup(lookup(&[
            (CMD_PATH_VAR, "/bin/true"),
            (IMAGE_PATH_VAR, "/tmp/img.sif"),
        ]))
        .unwrap_err();
        match err {
            Error::EnvMissing { var } => assert_eq!(var, TEST_DIR_VAR),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let err = TestEnv::from_lookup(lookup(&[
            (CMD_PATH_VAR, "  "),
            (TEST_DIR_VAR, "/tmp"),
            (IMAGE_PATH_VAR, "/tmp/img.sif"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::EnvMissing { .. }));
    }

    #[test]
    fn test_invalid_bool() {
        let err = TestEnv::from_lookup(lookup(&[
            (CMD_PATH_VAR, "/bin/true"),
            (TEST_DIR_VAR, "/tmp"),
            (IMAGE_PATH_VAR, "/tmp/img.sif"),
            (RUN_DISABLED_VAR, "sometimes"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::EnvInvalid { .. }));
        assert!(err.is_setup());
    }

    #[test]
    fn test_bare_name_resolved_through_path() {
        if which::which("sh").is_err() {
            return;
        }
        let env = TestEnv::from_lookup(lookup(&[
            (CMD_PATH_VAR, "sh"),
            (TEST_DIR_VAR, "/tmp"),
            (IMAGE_PATH_VAR, "/tmp/img.sif"),
        ]))
        .unwrap();
        assert!(env.cmd_path.is_absolute());
    }
}
