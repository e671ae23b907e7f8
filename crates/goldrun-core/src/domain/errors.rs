use super::DirectiveTarget;
use crate::numerics::ComparisonFailure;
use std::path::PathBuf;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarnessErrorCategory {
    Regression,
    InputValidation,
    IoSystem,
    Execution,
    Internal,
}

impl HarnessErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Regression => 1,
            Self::InputValidation => 2,
            Self::IoSystem => 3,
            Self::Execution => 4,
            Self::Internal => 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "RegressionFailure",
            Self::InputValidation => "InputValidationError",
            Self::IoSystem => "IoSystemError",
            Self::Execution => "ExecutionError",
            Self::Internal => "InternalError",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("no {target} node in '{}'", document.display())]
    DirectiveNotFound {
        document: PathBuf,
        target: DirectiveTarget,
    },
    #[error("{count} {target} nodes in '{}'; directive is ambiguous", document.display())]
    AmbiguousDirective {
        document: PathBuf,
        target: DirectiveTarget,
        count: usize,
    },
    #[error("restart source '{}' does not exist", path.display())]
    RestartSourceMissing { path: PathBuf },
    #[error("failed to parse template '{}': {source}", path.display())]
    TemplateParse {
        path: PathBuf,
        source: roxmltree::Error,
    },
    #[error("derived document would overwrite its template '{}'", path.display())]
    DerivedPathCollision { path: PathBuf },
    #[error("solver '{}' exited with status {status}; stderr tail:\n{stderr_tail}", executable.display())]
    SolverExecution {
        executable: PathBuf,
        status: i32,
        stderr_tail: String,
    },
    #[error(
        "artifact '{}' differs from reference '{}' (diff exit status {status}):\n{output_tail}",
        produced.display(),
        reference.display()
    )]
    ArtifactMismatch {
        produced: PathBuf,
        reference: PathBuf,
        status: i32,
        output_tail: String,
    },
    #[error("reference artifact '{}' does not exist", path.display())]
    ReferenceArtifactMissing { path: PathBuf },
    #[error("document '{}' declares no output artifact ({target})", document.display())]
    OutputArtifactUndeclared {
        document: PathBuf,
        target: DirectiveTarget,
    },
    #[error("accelerator run requested but no accelerator is configured")]
    AcceleratorUnavailable,
    #[error("'{}' did not finish within {timeout_secs}s; stderr tail:\n{stderr_tail}", program.display())]
    ProcessTimeout {
        program: PathBuf,
        timeout_secs: u64,
        stderr_tail: String,
    },
    #[error("failed to launch '{}': {source}", program.display())]
    ProcessSpawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("channel '{label}' reported unparsable value '{literal}' on line {line}")]
    MalformedChannelValue {
        label: String,
        literal: String,
        line: usize,
    },
    #[error("channel label must not be empty")]
    InvalidChannelLabel,
    #[error("channel '{name}' is not registered in the channel catalog")]
    UnknownChannel { name: String },
    #[error(transparent)]
    ComparisonMismatch(#[from] ComparisonFailure),
    #[error("invalid cleanup pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },
    #[error("scenario '{scenario}' has no variant for tier '{tier}'")]
    TierUnavailable { scenario: String, tier: String },
    #[error("invalid directive '{text}': {reason}")]
    InvalidDirective { text: String, reason: String },
    #[error("{context} '{}': {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid harness config '{}': {message}", path.display())]
    Config { path: PathBuf, message: String },
    #[error("invalid scenario manifest '{}': {message}", path.display())]
    Manifest { path: PathBuf, message: String },
    #[error("failed to write report '{}': {message}", path.display())]
    Report { path: PathBuf, message: String },
}

impl HarnessError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub const fn category(&self) -> HarnessErrorCategory {
        match self {
            Self::SolverExecution { .. }
            | Self::ArtifactMismatch { .. }
            | Self::ComparisonMismatch(_) => HarnessErrorCategory::Regression,
            Self::DirectiveNotFound { .. }
            | Self::AmbiguousDirective { .. }
            | Self::RestartSourceMissing { .. }
            | Self::TemplateParse { .. }
            | Self::DerivedPathCollision { .. }
            | Self::ReferenceArtifactMissing { .. }
            | Self::OutputArtifactUndeclared { .. }
            | Self::AcceleratorUnavailable
            | Self::InvalidChannelLabel
            | Self::UnknownChannel { .. }
            | Self::InvalidPattern { .. }
            | Self::InvalidDirective { .. }
            | Self::TierUnavailable { .. }
            | Self::Config { .. }
            | Self::Manifest { .. } => HarnessErrorCategory::InputValidation,
            Self::ProcessTimeout { .. }
            | Self::ProcessSpawn { .. }
            | Self::MalformedChannelValue { .. } => HarnessErrorCategory::Execution,
            Self::Io { .. } | Self::Report { .. } => HarnessErrorCategory::IoSystem,
        }
    }

    pub const fn placeholder(&self) -> &'static str {
        match self {
            Self::DirectiveNotFound { .. } => "TEMPLATE.DIRECTIVE_NOT_FOUND",
            Self::AmbiguousDirective { .. } => "TEMPLATE.AMBIGUOUS_DIRECTIVE",
            Self::RestartSourceMissing { .. } => "TEMPLATE.RESTART_SOURCE_MISSING",
            Self::TemplateParse { .. } => "TEMPLATE.PARSE",
            Self::DerivedPathCollision { .. } => "TEMPLATE.PATH_COLLISION",
            Self::SolverExecution { .. } => "RUN.SOLVER_EXIT",
            Self::ArtifactMismatch { .. } => "RUN.ARTIFACT_MISMATCH",
            Self::ReferenceArtifactMissing { .. } => "RUN.REFERENCE_MISSING",
            Self::OutputArtifactUndeclared { .. } => "RUN.OUTPUT_UNDECLARED",
            Self::AcceleratorUnavailable => "RUN.ACCELERATOR_UNAVAILABLE",
            Self::ProcessTimeout { .. } => "RUN.TIMEOUT",
            Self::ProcessSpawn { .. } => "RUN.SPAWN",
            Self::MalformedChannelValue { .. } => "PARSE.MALFORMED_CHANNEL_VALUE",
            Self::InvalidChannelLabel => "PARSE.INVALID_CHANNEL_LABEL",
            Self::UnknownChannel { .. } => "PARSE.UNKNOWN_CHANNEL",
            Self::ComparisonMismatch(_) => "CHECK.COMPARISON_MISMATCH",
            Self::InvalidPattern { .. } => "WORKDIR.INVALID_PATTERN",
            Self::InvalidDirective { .. } => "INPUT.INVALID_DIRECTIVE",
            Self::TierUnavailable { .. } => "INPUT.TIER_UNAVAILABLE",
            Self::Io { .. } => "IO.FILESYSTEM",
            Self::Config { .. } => "INPUT.CONFIG",
            Self::Manifest { .. } => "INPUT.MANIFEST",
            Self::Report { .. } => "IO.REPORT",
        }
    }

    pub const fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.placeholder(), self)
    }

    pub fn fatal_exit_line(&self) -> String {
        format!("FATAL EXIT CODE: {}", self.exit_code())
    }
}
