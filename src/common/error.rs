//! Error types for the conformance harness
//!
//! Setup problems (environment, configuration, privilege, group resources)
//! and spawn failures are fatal for the scenario that hits them. Timeouts and
//! mismatches are normally carried as structured values in
//! [`ExecutionResult`](crate::harness::ExecutionResult) and
//! [`Failure`](crate::harness::Failure) instead of being raised.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the conformance harness
#[derive(Error, Debug)]
pub enum Error {
    // === Environment Errors ===
    #[error("Required environment variable {var} is not set")]
    EnvMissing { var: String },

    #[error("Environment variable {var} has invalid value '{value}': {reason}")]
    EnvInvalid {
        var: String,
        value: String,
        reason: String,
    },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Invalid suite file '{path}': {message}")]
    SuiteParse { path: PathBuf, message: String },

    // === Setup Errors ===
    #[error("Privilege elevation failed: {0}")]
    Privilege(String),

    #[error("Failed to acquire resource '{name}': {reason}")]
    Resource { name: String, reason: String },

    // === Process Errors ===
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Pseudo-terminal error: {0}")]
    Pty(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Test Errors ===
    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid environment value error
    pub fn env_invalid(var: &str, value: &str, reason: &str) -> Self {
        Self::EnvInvalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a resource acquisition error
    pub fn resource<S: Into<String>>(name: &str, reason: S) -> Self {
        Self::Resource {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a spawn error for the given program
    pub fn spawn(program: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Whether this error belongs to the setup category
    ///
    /// Setup errors abort a scenario before anything is asserted.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::EnvMissing { .. }
                | Error::EnvInvalid { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
                | Error::SuiteParse { .. }
                | Error::Privilege(_)
                | Error::Resource { .. }
                | Error::Pty(_)
        )
    }
}
