//! End-to-end integration tests for the conformance harness
//!
//! These tests run the built `conformance` binary against
//! `tests/fixtures/fake-cli.sh`, a shell stand-in for a container CLI, and
//! check the exit status, the human report and the JSON report.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Test context with paths and cleanup
struct TestContext {
    /// Temporary directory for this test
    temp_dir: PathBuf,
    /// Path to the harness binary
    conformance_bin: PathBuf,
    /// Path to fixtures directory
    fixtures_dir: PathBuf,
    /// Stand-in image file
    image: PathBuf,
    /// Config directory (XDG_CONFIG_HOME)
    config_dir: PathBuf,
}

impl TestContext {
    /// Create a new test context
    fn new(test_name: &str) -> Self {
        let temp_base = env::temp_dir().join("conformance-cli-tests");
        let temp_dir = temp_base.join(test_name);

        // Clean up any previous test artifacts
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");

        let config_dir = temp_dir.join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        let image = temp_dir.join("test.sif");
        fs::write(&image, b"SIF").expect("Failed to write image");

        let manifest_dir = env!("CARGO_MANIFEST_DIR");
        let fixtures_dir = PathBuf::from(manifest_dir).join("tests").join("fixtures");

        Self {
            temp_dir,
            conformance_bin: PathBuf::from(env!("CARGO_BIN_EXE_conformance")),
            fixtures_dir,
            image,
            config_dir,
        }
    }

    /// Path to the fake CLI, made executable if the checkout lost the mode
    fn fake_cli(&self) -> PathBuf {
        let path = self.fixtures_dir.join("fake-cli.sh");
        let mut perms = fs::metadata(&path).expect("fake-cli.sh missing").permissions();
        if perms.mode() & 0o111 != 0o111 {
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("Failed to chmod fake-cli.sh");
        }
        path
    }

    /// Write a suite file into the temp dir
    fn write_suite(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.join(name);
        fs::write(&path, content).expect("Failed to write suite");
        path
    }

    /// Create a config file for the test
    fn create_config(&self, content: &str) {
        let config_path = self.config_dir.join("conformance").join("config.toml");
        fs::create_dir_all(config_path.parent().unwrap()).expect("Failed to create config dir");
        fs::write(&config_path, content).expect("Failed to write config");
    }

    /// Run the harness with the E2E environment pointing at the fake CLI
    fn run_conformance(&self, args: &[&str]) -> HarnessOutput {
        let mut cmd = self.command(args);
        cmd.env("E2E_CMD_PATH", self.fake_cli())
            .env("E2E_TEST_DIR", self.temp_dir.join("work"))
            .env("E2E_IMAGE_PATH", &self.image);
        run(cmd)
    }

    /// Run the harness with no E2E environment at all
    fn run_without_env(&self, args: &[&str]) -> HarnessOutput {
        run(self.command(args))
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.conformance_bin);
        cmd.args(args)
            .env_remove("E2E_CMD_PATH")
            .env_remove("E2E_TEST_DIR")
            .env_remove("E2E_IMAGE_PATH")
            .env_remove("E2E_RUN_DISABLED")
            .env_remove("RUST_LOG")
            .env_remove("SUDO_UID")
            .env_remove("SUDO_GID")
            .env("XDG_CONFIG_HOME", &self.config_dir)
            .env("NO_COLOR", "1");
        cmd
    }

    fn smoke_suite(&self) -> String {
        self.fixtures_dir
            .join("smoke.yaml")
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        // Preserve artifacts when PRESERVE_CONFORMANCE_TEST_ARTIFACTS=1
        let preserve = env::var("PRESERVE_CONFORMANCE_TEST_ARTIFACTS")
            .unwrap_or_default()
            .to_ascii_lowercase();

        if !(preserve == "1" || preserve == "true" || preserve == "yes") {
            let _ = fs::remove_dir_all(&self.temp_dir);
        }
    }
}

/// Output from a harness run
#[derive(Debug)]
struct HarnessOutput {
    stdout: String,
    stderr: String,
    success: bool,
    code: Option<i32>,
}

fn run(mut cmd: Command) -> HarnessOutput {
    let output = cmd.output().expect("Failed to run conformance");
    HarnessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        code: output.status.code(),
    }
}

fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "Expected '{}' in output:\n{}",
        needle,
        haystack
    );
}

// ============== Tests ==============

#[test]
fn test_smoke_suite_passes() {
    let ctx = TestContext::new("smoke_suite_passes");
    let suite = ctx.smoke_suite();
    let output = ctx.run_conformance(&["run", &suite]);

    assert!(
        output.success,
        "Suite failed:\nstdout: {}\nstderr: {}",
        output.stdout, output.stderr
    );
    assert_contains(&output.stdout, "smoke");
    assert_contains(&output.stdout, "NoCommand");
    assert_contains(&output.stdout, "ShellHostname");
    assert_contains(&output.stdout, "10 passed, 0 failed, 1 skipped");
    assert_contains(&output.stdout, "requires network access");
}

#[test]
fn test_json_report() {
    let ctx = TestContext::new("json_report");
    let suite = ctx.smoke_suite();
    let output = ctx.run_conformance(&["run", &suite, "--json", "--jobs", "4"]);
    assert!(output.success, "stderr: {}", output.stderr);

    let report: serde_json::Value =
        serde_json::from_str(&output.stdout).expect("stdout is not JSON");
    assert_eq!(report["name"], "smoke");

    let groups = report["groups"].as_array().unwrap();
    let names: Vec<_> = groups.iter().map(|g| g["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["exec", "STDPIPE", "run", "Shell"]);

    let exec = groups[0]["scenarios"].as_array().unwrap();
    assert_eq!(exec[0]["name"], "NoCommand");
    assert_eq!(exec[0]["status"], "passed");
    assert_eq!(exec[0]["state"]["state"], "completed");
    assert_eq!(exec[0]["state"]["exit_code"], 1);

    let run = groups[2]["scenarios"].as_array().unwrap();
    assert_eq!(run[1]["status"], "skipped");
}

#[test]
fn test_failing_scenario_exits_nonzero() {
    let ctx = TestContext::new("failing_scenario");
    let suite = ctx.write_suite(
        "failing.yaml",
        r#"
name: failing
groups:
  - name: exec
    command: exec
    scenarios:
      - name: WrongExit
        args: ["{image}", sh, -c, "echo visible-stdout; echo visible-stderr >&2; exit 2"]
        exit: 0
"#,
    );
    let output = ctx.run_conformance(&["run", suite.to_str().unwrap(), "--verbose"]);

    assert!(!output.success);
    assert_eq!(output.code, Some(1));
    assert_contains(&output.stdout, "expected exit 0, got 2");
    assert_contains(&output.stdout, "visible-stdout");
    assert_contains(&output.stdout, "visible-stderr");
    assert_contains(&output.stderr, "1 of 1 scenarios failed");
}

#[test]
fn test_timeout_flag() {
    let ctx = TestContext::new("timeout_flag");
    let suite = ctx.write_suite(
        "sleep.yaml",
        r#"
name: sleep
groups:
  - name: exec
    command: exec
    scenarios:
      - { name: Sleep, args: ["{image}", sleep, "30"], exit: 0 }
"#,
    );
    let started = std::time::Instant::now();
    let output = ctx.run_conformance(&["run", suite.to_str().unwrap(), "--timeout", "1"]);

    assert!(!output.success);
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert_contains(&output.stdout, "timed out after 1.0s");
}

#[test]
fn test_filter() {
    let ctx = TestContext::new("filter");
    let suite = ctx.smoke_suite();
    let output = ctx.run_conformance(&["run", &suite, "--filter", "STDPIPE/"]);

    assert!(output.success, "stderr: {}", output.stderr);
    assert_contains(&output.stdout, "TrueSTDIN");
    assert_contains(&output.stdout, "2 passed, 0 failed, 0 skipped");
    assert!(!output.stdout.contains("ShellHostname"));
}

#[test]
fn test_run_disabled_runs_network_scenarios() {
    let ctx = TestContext::new("run_disabled");
    let suite = ctx.smoke_suite();
    let mut cmd = ctx.command(&["run", &suite, "--filter", "run/ExecTrueDocker"]);
    cmd.env("E2E_CMD_PATH", ctx.fake_cli())
        .env("E2E_TEST_DIR", ctx.temp_dir.join("work"))
        .env("E2E_IMAGE_PATH", &ctx.image)
        .env("E2E_RUN_DISABLED", "1");
    let output = run(cmd);

    // the fake CLI refuses registry URIs, so the scenario now runs and fails
    assert!(!output.success);
    assert_contains(&output.stdout, "expected exit 0, got 255");
}

#[test]
fn test_missing_environment() {
    let ctx = TestContext::new("missing_env");
    let suite = ctx.smoke_suite();
    let output = ctx.run_without_env(&["run", &suite]);

    assert!(!output.success);
    assert_contains(&output.stderr, "E2E_CMD_PATH");
}

#[test]
fn test_invalid_run_disabled_value() {
    let ctx = TestContext::new("invalid_run_disabled");
    let mut cmd = ctx.command(&["env"]);
    cmd.env("E2E_CMD_PATH", ctx.fake_cli())
        .env("E2E_TEST_DIR", &ctx.temp_dir)
        .env("E2E_IMAGE_PATH", &ctx.image)
        .env("E2E_RUN_DISABLED", "maybe");
    let output = run(cmd);

    assert!(!output.success);
    assert_contains(&output.stderr, "E2E_RUN_DISABLED");
    assert_contains(&output.stderr, "maybe");
}

#[test]
fn test_bad_suite_file() {
    let ctx = TestContext::new("bad_suite");
    let suite = ctx.write_suite(
        "bad.yaml",
        "name: bad\ngroups:\n  - name: g\n    command: run\n    scenarios:\n      - { name: a, exit: 300 }\n",
    );
    let output = ctx.run_conformance(&["run", suite.to_str().unwrap()]);

    assert!(!output.success);
    assert_contains(&output.stderr, "bad.yaml");
    assert_contains(&output.stderr, "0..=255");
}

#[test]
fn test_list() {
    let ctx = TestContext::new("list");
    let suite = ctx.smoke_suite();
    let output = ctx.run_without_env(&["list", &suite]);

    assert!(output.success, "stderr: {}", output.stderr);
    assert_contains(&output.stdout, "smoke");
    assert_contains(&output.stdout, "ExecTrueDocker");
    assert_contains(&output.stdout, "[network]");
    assert_contains(&output.stdout, "[console]");
    assert_contains(&output.stdout, "11 of 11 scenarios");
}

#[test]
fn test_env_json() {
    let ctx = TestContext::new("env_json");
    let output = ctx.run_conformance(&["env", "--json"]);
    assert!(output.success, "stderr: {}", output.stderr);

    let value: serde_json::Value = serde_json::from_str(&output.stdout).unwrap();
    let env = &value["environment"];
    assert_eq!(
        Path::new(env["cmd_path"].as_str().unwrap()),
        ctx.fake_cli().as_path()
    );
    assert_eq!(env["run_disabled"], false);
}

#[test]
fn test_config_file_timeouts() {
    let ctx = TestContext::new("config_file");
    ctx.create_config("[timeouts]\nprocess_secs = 1\ndrain_grace_ms = 200\n");
    let suite = ctx.write_suite(
        "sleep.yaml",
        r#"
name: sleep
groups:
  - name: exec
    command: exec
    scenarios:
      - { name: Sleep, args: ["{image}", sleep, "30"], exit: 0 }
"#,
    );
    let output = ctx.run_conformance(&["run", suite.to_str().unwrap()]);

    assert!(!output.success);
    assert_contains(&output.stdout, "timed out");
}

#[test]
fn test_invalid_config_file() {
    let ctx = TestContext::new("invalid_config");
    ctx.create_config("[timeouts\nprocess_secs = ");
    let suite = ctx.smoke_suite();
    let output = ctx.run_conformance(&["run", &suite]);

    assert!(!output.success);
    assert_contains(&output.stderr, "Invalid configuration file");
}

#[test]
fn test_zero_timeouts_rejected() {
    let ctx = TestContext::new("zero_timeouts");
    let suite = ctx.smoke_suite();

    let output = ctx.run_conformance(&["run", &suite, "--timeout", "0"]);
    assert!(!output.success);
    assert_contains(&output.stderr, "--timeout");

    ctx.create_config("[timeouts]\nprocess_secs = 0\n");
    let output = ctx.run_conformance(&["run", &suite]);
    assert!(!output.success);
    assert_contains(&output.stderr, "timeouts.process_secs must be greater than 0");
}

#[test]
fn test_log_file_keeps_debug_trace() {
    let ctx = TestContext::new("log_file");
    let suite = ctx.smoke_suite();
    let log = ctx.temp_dir.join("logs").join("run.log");
    let output = ctx.run_conformance(&["run", &suite, "--log-file", log.to_str().unwrap()]);
    assert!(output.success, "stderr: {}", output.stderr);

    let content = fs::read_to_string(&log).expect("log file missing");
    assert_contains(&content, "Running suite");
    // debug events reach the file without --verbose
    assert_contains(&content, "Spawned child");
    assert!(!output.stderr.contains("Spawned child"));
}
