//! Per-class directory scoping and per-test artifact tracking.
//!
//! Cleanup and directory restoration run on every exit path; their failures are
//! logged and reported, never raised, so they cannot mask a test's own failure.

use crate::config::HarnessConfig;
use crate::domain::{HarnessError, HarnessResult};
use globset::{Glob, GlobMatcher};
use serde::Serialize;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Changes the process working directory for the lifetime of the guard.
#[derive(Debug)]
pub struct DirectoryScope {
    previous: PathBuf,
    restored: bool,
}

impl DirectoryScope {
    pub fn enter(dir: impl AsRef<Path>) -> HarnessResult<Self> {
        let dir = dir.as_ref();
        let previous = env::current_dir().map_err(|source| {
            HarnessError::io("failed to read current directory", ".", source)
        })?;
        env::set_current_dir(dir)
            .map_err(|source| HarnessError::io("failed to enter test directory", dir, source))?;
        tracing::debug!(entered = %dir.display(), previous = %previous.display(), "entered test directory");
        Ok(Self {
            previous,
            restored: false,
        })
    }

    pub fn previous(&self) -> &Path {
        &self.previous
    }

    pub fn leave(mut self) -> HarnessResult<()> {
        self.restored = true;
        env::set_current_dir(&self.previous).map_err(|source| {
            HarnessError::io("failed to restore working directory", &self.previous, source)
        })
    }
}

impl Drop for DirectoryScope {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(error) = env::set_current_dir(&self.previous) {
            tracing::warn!(
                previous = %self.previous.display(),
                %error,
                "failed to restore working directory"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything one test needs to know about its files. Built fresh per test.
#[derive(Debug)]
pub struct TestContext {
    test_dir: PathBuf,
    input_dir: PathBuf,
    mesh_dir: PathBuf,
    gold_subdir: String,
    tracked: Vec<PathBuf>,
    patterns: Vec<(String, GlobMatcher)>,
    cleaned: bool,
}

impl TestContext {
    pub fn new(test_dir: impl Into<PathBuf>, config: &HarnessConfig) -> Self {
        Self {
            test_dir: test_dir.into(),
            input_dir: config.input_dir.clone(),
            mesh_dir: config.mesh_dir.clone(),
            gold_subdir: config.gold_subdir.clone(),
            tracked: Vec::new(),
            patterns: Vec::new(),
            cleaned: false,
        }
    }

    pub fn test_dir(&self) -> &Path {
        &self.test_dir
    }

    pub fn resolve_input(&self, name: impl AsRef<Path>) -> PathBuf {
        self.input_dir.join(name)
    }

    pub fn resolve_mesh(&self, name: impl AsRef<Path>) -> PathBuf {
        self.mesh_dir.join(name)
    }

    /// Copies a bare mesh name from the shared mesh directory into the test directory and
    /// tracks the copy. Meshes already present locally, and paths, are left alone.
    pub fn stage_mesh(&mut self, name: impl AsRef<Path>) -> HarnessResult<Option<PathBuf>> {
        let name = name.as_ref();
        if name.is_absolute() || name.components().count() != 1 {
            return Ok(None);
        }
        let local = self.resolve_local(name);
        let shared = self.resolve_mesh(name);
        if local.exists() || !shared.is_file() {
            return Ok(None);
        }
        fs::copy(&shared, &local)
            .map_err(|error| HarnessError::io("failed to stage mesh", &shared, error))?;
        tracing::debug!(mesh = %shared.display(), staged = %local.display(), "staged shared mesh");
        Ok(Some(self.track(local)))
    }

    pub fn resolve_reference(&self, artifact_name: impl AsRef<Path>) -> PathBuf {
        self.test_dir.join(&self.gold_subdir).join(artifact_name)
    }

    /// Paths relative to the test directory become absolute.
    pub fn resolve_local(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.test_dir.join(path)
        }
    }

    /// Templates live in the shared input directory, falling back to the test directory.
    pub fn resolve_template(&self, name: impl AsRef<Path>) -> PathBuf {
        let name = name.as_ref();
        let shared = self.resolve_input(name);
        if shared.is_file() {
            shared
        } else {
            self.resolve_local(name)
        }
    }

    pub fn track(&mut self, path: impl AsRef<Path>) -> PathBuf {
        let path = self.resolve_local(path);
        if !self.tracked.contains(&path) {
            self.tracked.push(path.clone());
        }
        self.cleaned = false;
        path
    }

    /// Removes every top-level file of the test directory matching `pattern` at cleanup.
    pub fn track_pattern(&mut self, pattern: &str) -> HarnessResult<()> {
        let matcher = Glob::new(pattern)
            .map_err(|source| HarnessError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();
        self.patterns.push((pattern.to_string(), matcher));
        self.cleaned = false;
        Ok(())
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }

    /// Copies a configuration document from the shared input directory into the test directory.
    pub fn copy_input(&mut self, name: impl AsRef<Path>) -> HarnessResult<PathBuf> {
        let name = name.as_ref();
        let source = self.resolve_input(name);
        let destination = self.resolve_local(name.file_name().unwrap_or(name.as_os_str()));
        if source == destination {
            return Ok(destination);
        }
        fs::copy(&source, &destination)
            .map_err(|error| HarnessError::io("failed to copy input document", &source, error))?;
        Ok(self.track(destination))
    }

    pub fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in self.tracked.drain(..) {
            remove_file(&path, &mut report);
        }

        if !self.patterns.is_empty() {
            match fs::read_dir(&self.test_dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let name = entry.file_name();
                        let is_match = self
                            .patterns
                            .iter()
                            .any(|(_, matcher)| matcher.is_match(Path::new(&name)));
                        if is_match && entry.path().is_file() {
                            remove_file(&entry.path(), &mut report);
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(dir = %self.test_dir.display(), %error, "failed to scan test directory");
                    report.failures.push(CleanupFailure {
                        path: self.test_dir.clone(),
                        message: error.to_string(),
                    });
                }
            }
            self.patterns.clear();
        }

        self.cleaned = true;
        report
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if !self.cleaned {
            self.cleanup();
        }
    }
}

fn remove_file(path: &Path, report: &mut CleanupReport) {
    match fs::remove_file(path) {
        Ok(()) => report.removed.push(path.to_path_buf()),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to remove test artifact");
            report.failures.push(CleanupFailure {
                path: path.to_path_buf(),
                message: error.to_string(),
            });
        }
    }
}
