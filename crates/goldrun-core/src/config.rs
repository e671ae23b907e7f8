//! Harness-wide settings: executables, shared fixture directories, naming
//! conventions and process timeouts.

use crate::domain::{DirectiveTarget, HarnessError, HarnessResult};
use crate::template::RestartPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "goldrun.json";
pub const DEFAULT_SOLVER_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_DIFF_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    pub solver: PathBuf,
    #[serde(default)]
    pub accelerator: Option<AcceleratorConfig>,
    pub diff: PathBuf,
    #[serde(default = "default_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_dir")]
    pub mesh_dir: PathBuf,
    #[serde(default = "default_gold_subdir")]
    pub gold_subdir: String,
    #[serde(default = "default_output_field")]
    pub output_field: DirectiveTarget,
    /// Mesh names read from this field are staged from `mesh_dir` into the test directory.
    #[serde(default = "default_mesh_field")]
    pub mesh_field: DirectiveTarget,
    #[serde(default = "default_restart_field")]
    pub restart_field: DirectiveTarget,
    #[serde(default = "default_restart_suffix")]
    pub restart_suffix: String,
    /// `null` disables the timeout.
    #[serde(default = "default_solver_timeout")]
    pub solver_timeout_secs: Option<u64>,
    #[serde(default = "default_diff_timeout")]
    pub diff_timeout_secs: Option<u64>,
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorConfig {
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    /// Suffix appended to a document's stem to find its accelerator variant.
    #[serde(default)]
    pub config_suffix: Option<String>,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_gold_subdir() -> String {
    "gold".to_string()
}

fn default_output_field() -> DirectiveTarget {
    DirectiveTarget::parameter("Exodus Output File")
}

fn default_mesh_field() -> DirectiveTarget {
    DirectiveTarget::parameter("Input Mesh File")
}

fn default_restart_field() -> DirectiveTarget {
    RestartPolicy::default().field
}

fn default_restart_suffix() -> String {
    RestartPolicy::default().artifact_suffix
}

fn default_solver_timeout() -> Option<u64> {
    Some(DEFAULT_SOLVER_TIMEOUT_SECS)
}

fn default_diff_timeout() -> Option<u64> {
    Some(DEFAULT_DIFF_TIMEOUT_SECS)
}

fn default_stderr_tail_lines() -> usize {
    20
}

impl HarnessConfig {
    pub fn new(solver: impl Into<PathBuf>, diff: impl Into<PathBuf>) -> Self {
        Self {
            solver: solver.into(),
            accelerator: None,
            diff: diff.into(),
            input_dir: default_dir(),
            mesh_dir: default_dir(),
            gold_subdir: default_gold_subdir(),
            output_field: default_output_field(),
            mesh_field: default_mesh_field(),
            restart_field: default_restart_field(),
            restart_suffix: default_restart_suffix(),
            solver_timeout_secs: default_solver_timeout(),
            diff_timeout_secs: default_diff_timeout(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }

    /// Loads a JSON config; relative paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| HarnessError::io("failed to read harness config", path, source))?;
        let config: Self = serde_json::from_str(&content).map_err(|source| HarnessError::Config {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;
        let absolute = std::path::absolute(path)
            .map_err(|source| HarnessError::io("failed to resolve harness config path", path, source))?;
        let base = absolute.parent().unwrap_or_else(|| Path::new("/"));
        Ok(config.resolve_relative_to(base))
    }

    pub fn resolve_relative_to(mut self, base: &Path) -> Self {
        self.solver = resolve_executable(base, self.solver);
        self.diff = resolve_executable(base, self.diff);
        self.input_dir = resolve_dir(base, self.input_dir);
        self.mesh_dir = resolve_dir(base, self.mesh_dir);
        if let Some(accelerator) = self.accelerator.as_mut() {
            accelerator.executable = accelerator
                .executable
                .take()
                .map(|executable| resolve_executable(base, executable));
        }
        self
    }

    pub fn solver_timeout(&self) -> Option<Duration> {
        self.solver_timeout_secs.map(Duration::from_secs)
    }

    pub fn diff_timeout(&self) -> Option<Duration> {
        self.diff_timeout_secs.map(Duration::from_secs)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            field: self.restart_field.clone(),
            artifact_suffix: self.restart_suffix.clone(),
        }
    }
}

fn resolve_dir(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Bare program names stay untouched so they are looked up on `PATH`.
fn resolve_executable(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() || path.components().count() <= 1 {
        path
    } else {
        base.join(path)
    }
}
