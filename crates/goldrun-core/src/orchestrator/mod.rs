//! Solver and artifact-diff invocation for a single regression run.

pub mod process;

pub use process::{CommandSpec, ProcessOutput, ProcessRunner, SystemProcessRunner, tail_lines};

use crate::config::{AcceleratorConfig, HarnessConfig};
use crate::domain::{DEFAULT_VALUE_ATTRIBUTE, HarnessError, HarnessResult, RunResult};
use crate::template;
use crate::workdir::TestContext;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub config_path: PathBuf,
    pub solver_flags: Vec<String>,
    pub diff_flags: Vec<String>,
    pub compare_to_gold: bool,
    pub use_accelerator: bool,
    /// Copy the document from the shared input directory before running.
    pub copy_input: bool,
}

impl RunRequest {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            solver_flags: Vec::new(),
            diff_flags: Vec::new(),
            compare_to_gold: true,
            use_accelerator: false,
            copy_input: false,
        }
    }

    pub fn solver_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.solver_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn diff_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.diff_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn compare_to_gold(mut self, compare: bool) -> Self {
        self.compare_to_gold = compare;
        self
    }

    pub fn use_accelerator(mut self, use_accelerator: bool) -> Self {
        self.use_accelerator = use_accelerator;
        self
    }

    pub fn copy_input(mut self, copy_input: bool) -> Self {
        self.copy_input = copy_input;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOrchestrator<R = SystemProcessRunner> {
    config: HarnessConfig,
    runner: R,
}

impl RunOrchestrator<SystemProcessRunner> {
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_runner(config, SystemProcessRunner::default())
    }
}

impl<R: ProcessRunner> RunOrchestrator<R> {
    pub fn with_runner(config: HarnessConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Runs the solver on the requested document, then diffs its artifact against gold.
    ///
    /// A solver failure is raised before the diff tool is ever launched.
    pub fn run(&self, context: &mut TestContext, request: &RunRequest) -> HarnessResult<RunResult> {
        let accelerator = if request.use_accelerator {
            Some(
                self.config
                    .accelerator
                    .as_ref()
                    .ok_or(HarnessError::AcceleratorUnavailable)?,
            )
        } else {
            None
        };
        let select = |document: PathBuf| match accelerator {
            Some(accelerator) => accelerator_variant(&document, accelerator),
            None => document,
        };

        // The variant is looked up where the document lives, before any copy.
        let document = if request.copy_input {
            let source = select(context.resolve_input(&request.config_path));
            context.copy_input(source)?
        } else {
            select(context.resolve_local(&request.config_path))
        };

        let (executable, mut args) = match accelerator {
            Some(accelerator) => (
                accelerator
                    .executable
                    .clone()
                    .unwrap_or_else(|| self.config.solver.clone()),
                accelerator.extra_flags.clone(),
            ),
            None => (self.config.solver.clone(), Vec::new()),
        };
        args.extend(request.solver_flags.iter().cloned());

        if let Some(mesh) = template::read_value_from_path(
            &document,
            &self.config.mesh_field,
            DEFAULT_VALUE_ATTRIBUTE,
        )?
        .filter(|mesh| !mesh.trim().is_empty())
        {
            context.stage_mesh(&mesh)?;
        }

        let output_name = template::read_value_from_path(
            &document,
            &self.config.output_field,
            DEFAULT_VALUE_ATTRIBUTE,
        )?
        .filter(|name| !name.trim().is_empty());
        let produced = output_name.as_ref().map(|name| context.track(name));

        // Fixture problems surface before an expensive solver run.
        let reference = if request.compare_to_gold {
            let name = output_name
                .as_ref()
                .ok_or_else(|| HarnessError::OutputArtifactUndeclared {
                    document: document.clone(),
                    target: self.config.output_field.clone(),
                })?;
            let reference = context.resolve_reference(name);
            if !reference.is_file() {
                return Err(HarnessError::ReferenceArtifactMissing { path: reference });
            }
            Some(reference)
        } else {
            None
        };

        let solver = CommandSpec {
            program: executable,
            args: std::iter::once(document.to_string_lossy().into_owned())
                .chain(args)
                .collect(),
            current_dir: context.test_dir().to_path_buf(),
            timeout: self.config.solver_timeout(),
        };
        tracing::info!(command = %solver.display_line(), "launching solver");
        let solver_output = self.runner.run(&solver)?;
        self.ensure_finished(&solver, &solver_output)?;
        if !solver_output.succeeded() {
            return Err(HarnessError::SolverExecution {
                executable: solver.program,
                status: solver_output.status.unwrap_or(-1),
                stderr_tail: tail_lines(&solver_output.stderr, self.config.stderr_tail_lines),
            });
        }
        tracing::info!(
            document = %document.display(),
            elapsed_ms = solver_output.duration.as_millis() as u64,
            "solver finished"
        );

        let mut result = RunResult {
            config_path: document,
            solver_status: solver_output.status.unwrap_or_default(),
            stdout: solver_output.stdout,
            stderr: solver_output.stderr,
            solver_duration: solver_output.duration,
            produced_artifact: produced.clone(),
            diff_status: None,
            diff_stdout: None,
            diff_duration: None,
        };

        let (Some(reference), Some(produced)) = (reference, produced) else {
            return Ok(result);
        };

        let diff = CommandSpec {
            program: self.config.diff.clone(),
            args: [
                produced.to_string_lossy().into_owned(),
                reference.to_string_lossy().into_owned(),
            ]
            .into_iter()
            .chain(request.diff_flags.iter().cloned())
            .collect(),
            current_dir: context.test_dir().to_path_buf(),
            timeout: self.config.diff_timeout(),
        };
        tracing::info!(command = %diff.display_line(), "launching artifact diff");
        let diff_output = self.runner.run(&diff)?;
        self.ensure_finished(&diff, &diff_output)?;
        if !diff_output.succeeded() {
            let combined = format!("{}{}", diff_output.stdout, diff_output.stderr);
            return Err(HarnessError::ArtifactMismatch {
                produced,
                reference,
                status: diff_output.status.unwrap_or(-1),
                output_tail: tail_lines(&combined, self.config.stderr_tail_lines),
            });
        }
        tracing::info!(
            produced = %produced.display(),
            reference = %reference.display(),
            "artifact matches reference"
        );

        result.diff_status = diff_output.status;
        result.diff_stdout = Some(diff_output.stdout);
        result.diff_duration = Some(diff_output.duration);
        Ok(result)
    }

    fn ensure_finished(&self, command: &CommandSpec, output: &ProcessOutput) -> HarnessResult<()> {
        if !output.timed_out {
            return Ok(());
        }
        Err(HarnessError::ProcessTimeout {
            program: command.program.clone(),
            timeout_secs: command.timeout.map(|timeout| timeout.as_secs()).unwrap_or_default(),
            stderr_tail: tail_lines(&output.stderr, self.config.stderr_tail_lines),
        })
    }
}

/// `<stem><suffix>.<ext>` beside `document` when it exists, else `document` itself.
pub fn accelerator_variant(document: &Path, accelerator: &AcceleratorConfig) -> PathBuf {
    let Some(suffix) = accelerator.config_suffix.as_deref() else {
        return document.to_path_buf();
    };
    let Some(stem) = document.file_stem() else {
        return document.to_path_buf();
    };
    let mut name = stem.to_os_string();
    name.push(suffix);
    if let Some(extension) = document.extension() {
        name.push(".");
        name.push(extension);
    }
    let variant = document.with_file_name(name);
    if variant.is_file() {
        variant
    } else {
        document.to_path_buf()
    }
}
