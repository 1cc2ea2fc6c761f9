//! Scoped group resources
//!
//! Temp files, temp directories and built artifacts that a group's scenarios
//! share. Each acquisition hands back a [`ScopedResource`] carrying its own
//! release function; a [`ResourceSet`] releases them in reverse order, also
//! when acquisition fails halfway.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::{Error, Result};

use super::process::{run_program, RunOptions};
use super::template::Vars;

/// A resource declared by a group
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSpec {
    /// An empty (or pre-filled) temporary file
    TempFile {
        name: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        content: Option<String>,
        /// Parent directory; defaults to the system temp dir
        #[serde(default)]
        dir: Option<String>,
    },
    /// A temporary directory, removed recursively on release
    TempDir {
        name: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        dir: Option<String>,
    },
    /// A file produced by external commands, deleted on release
    Artifact {
        name: String,
        path: String,
        /// Commands run in order; `{<name>}` refers to `path`
        #[serde(default)]
        build: Vec<Vec<String>>,
    },
}

impl ResourceSpec {
    pub fn name(&self) -> &str {
        match self {
            ResourceSpec::TempFile { name, .. }
            | ResourceSpec::TempDir { name, .. }
            | ResourceSpec::Artifact { name, .. } => name,
        }
    }
}

type Release = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// An acquired resource and the function that releases it
pub struct ScopedResource {
    name: String,
    path: PathBuf,
    release: Option<Release>,
}

impl std::fmt::Debug for ScopedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedResource")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl ScopedResource {
    pub fn new(name: impl Into<String>, path: PathBuf, release: Release) -> Self {
        Self {
            name: name.into(),
            path,
            release: Some(release),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Variables this resource contributes
    ///
    /// `{name}` is the path and `{name.file_name}` its last component. Regular
    /// files also get `{name.size}` in bytes, read at call time.
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![(self.name.clone(), self.path.display().to_string())];
        if let Some(file_name) = self.path.file_name() {
            vars.push((
                format!("{}.file_name", self.name),
                file_name.to_string_lossy().into_owned(),
            ));
        }
        if let Ok(meta) = std::fs::metadata(&self.path) {
            if meta.is_file() {
                vars.push((format!("{}.size", self.name), meta.len().to_string()));
            }
        }
        vars
    }

    /// Release now and report the outcome
    pub fn release(mut self) -> io::Result<()> {
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedResource {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(e) = release() {
                tracing::warn!(resource = %self.name, error = %e, "Failed to release resource");
            }
        }
    }
}

/// Settings used while building artifacts
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Working directory for build commands and relative paths
    pub work_dir: PathBuf,
    pub run: RunOptions,
}

/// Acquire one resource, resolving its fields against `vars`
pub async fn acquire(
    spec: &ResourceSpec,
    vars: &Vars,
    options: &AcquireOptions,
) -> Result<ScopedResource> {
    let name = spec.name();
    let resolve_dir = |dir: &Option<String>| -> Result<PathBuf> {
        match dir {
            Some(d) => Ok(options.work_dir.join(vars.expand(d)?)),
            None => Ok(std::env::temp_dir()),
        }
    };

    match spec {
        ResourceSpec::TempFile {
            prefix,
            content,
            dir,
            ..
        } => {
            let dir = resolve_dir(dir)?;
            let mut builder = tempfile::Builder::new();
            if let Some(prefix) = prefix {
                builder.prefix(prefix);
            }
            let mut file = builder
                .tempfile_in(&dir)
                .map_err(|e| Error::resource(name, format!("temp file in {}: {e}", dir.display())))?;
            if let Some(content) = content {
                use std::io::Write;
                file.write_all(content.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| Error::resource(name, e.to_string()))?;
            }
            let temp_path = file.into_temp_path();
            let path = temp_path.to_path_buf();
            tracing::debug!(resource = name, path = %path.display(), "Created temp file");
            Ok(ScopedResource::new(
                name,
                path,
                Box::new(move || temp_path.close()),
            ))
        }

        ResourceSpec::TempDir { prefix, dir, .. } => {
            let dir = resolve_dir(dir)?;
            let mut builder = tempfile::Builder::new();
            if let Some(prefix) = prefix {
                builder.prefix(prefix);
            }
            let temp_dir = builder
                .tempdir_in(&dir)
                .map_err(|e| Error::resource(name, format!("temp dir in {}: {e}", dir.display())))?;
            let path = temp_dir.path().to_path_buf();
            tracing::debug!(resource = name, path = %path.display(), "Created temp dir");
            Ok(ScopedResource::new(
                name,
                path,
                Box::new(move || temp_dir.close()),
            ))
        }

        ResourceSpec::Artifact { path, build, .. } => {
            let path = options.work_dir.join(vars.expand(path)?);
            // the resource guards the path from here on, so a failed build
            // still removes partial output
            let resource = ScopedResource::new(name, path.clone(), Box::new(remove_path(path.clone())));

            let mut step_vars = vars.clone();
            step_vars.extend(resource.vars());

            for step in build {
                let argv = step_vars.expand_all(step)?;
                let Some((program, args)) = argv.split_first() else {
                    return Err(Error::resource(name, "empty build command"));
                };
                let program = which::which(program).unwrap_or_else(|_| PathBuf::from(program));
                let mut run = options.run.clone();
                run.dir = Some(options.work_dir.clone());

                tracing::debug!(resource = name, ?argv, "Building artifact");
                let result = run_program(&program, args, &run)
                    .await
                    .map_err(|e| Error::resource(name, e.to_string()))?;

                if let Some(failure) = &result.error {
                    return Err(Error::resource(
                        name,
                        format!("`{}` failed: {failure}\n{}", argv.join(" "), result.diagnostics()),
                    ));
                }
                if result.exit_code != 0 {
                    return Err(Error::resource(
                        name,
                        format!(
                            "`{}` exited with {}\n{}",
                            argv.join(" "),
                            result.exit_code,
                            result.diagnostics()
                        ),
                    ));
                }
            }

            Ok(resource)
        }
    }
}

fn remove_path(path: PathBuf) -> impl FnOnce() -> io::Result<()> + Send {
    move || match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
        Ok(_) => std::fs::remove_file(&path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resources of one group, released in reverse acquisition order
#[derive(Debug, Default)]
pub struct ResourceSet {
    resources: Vec<ScopedResource>,
}

impl ResourceSet {
    /// Acquire `specs` in order, adding each resource's variables to `vars`
    ///
    /// Later specs can refer to earlier ones. On failure everything acquired
    /// so far is released before the error is returned.
    pub async fn acquire_all(
        specs: &[ResourceSpec],
        vars: &mut Vars,
        options: &AcquireOptions,
    ) -> Result<Self> {
        let mut set = Self::default();
        for spec in specs {
            let resource = acquire(spec, vars, options).await?;
            vars.extend(resource.vars());
            set.resources.push(resource);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Release everything; returns the failures
    pub fn release(mut self) -> Vec<(String, io::Error)> {
        let mut errors = Vec::new();
        while let Some(resource) = self.resources.pop() {
            let name = resource.name().to_string();
            if let Err(e) = resource.release() {
                errors.push((name, e));
            }
        }
        errors
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        while let Some(resource) = self.resources.pop() {
            drop(resource);
        }
    }
}
