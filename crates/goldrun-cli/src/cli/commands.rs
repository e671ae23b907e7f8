use super::CliError;
use super::helpers::{format_values, load_config, load_optional_config, read_capture};
use goldrun_core::domain::{SubstitutionDirective, Tier};
use goldrun_core::numerics::assert_close_labeled;
use goldrun_core::parser::extract;
use goldrun_core::scenarios::{SuiteConfig, render_human_summary, run_suite};
use goldrun_core::template::{self, RestartPolicy, TemplateRequest};
use std::path::{Path, PathBuf};

#[derive(clap::Args)]
pub(super) struct RegressionArgs {
    /// Scenario manifest path
    #[arg(long, default_value = "scenarios.json")]
    manifest: PathBuf,

    /// Regression tier to run (push, daily or weekly)
    #[arg(long, default_value = "push")]
    tier: Tier,

    /// Run accelerator-enabled scenarios with the accelerator build
    #[arg(long)]
    accelerator: bool,

    /// Only run scenarios whose `class/id` contains this text
    #[arg(long)]
    filter: Option<String>,

    /// JSON report output path
    #[arg(long, default_value = "artifacts/regression/report.json")]
    report: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct ApplyArgs {
    /// Base template document
    template: PathBuf,

    /// Substitution in TAG:ATTRIBUTE:KEY=VALUE form (repeatable)
    #[arg(long = "set", value_name = "TAG:ATTRIBUTE:KEY=VALUE")]
    directives: Vec<SubstitutionDirective>,

    /// Shorthand for Parameter:name:KEY=VALUE (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    parameters: Vec<String>,

    /// Directory receiving the derived document
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Derived file name; defaults to a name derived from the directives
    #[arg(long)]
    output_name: Option<String>,

    /// Point the restart field at the template's previous solution
    #[arg(long)]
    restart: bool,
}

#[derive(clap::Args)]
pub(super) struct ExtractArgs {
    /// Literal channel label, including leading whitespace
    #[arg(long)]
    label: String,

    /// Console capture file, or `-` for stdin
    #[arg(default_value = "-")]
    input: PathBuf,

    /// Expected values; the command fails unless every value matches
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    expect: Option<Vec<f64>>,

    /// Relative tolerance for --expect
    #[arg(long, default_value_t = 1e-10)]
    rel_tol: f64,
}

pub(super) fn run_regression_command(config_path: &Path, args: RegressionArgs) -> Result<i32, CliError> {
    let harness = load_config(config_path)?;
    let mut suite = SuiteConfig::new(args.manifest, harness, args.tier);
    suite.accelerator = args.accelerator;
    suite.filter = args.filter;
    suite.report_path = Some(args.report.clone());

    let report = run_suite(&suite)?;
    println!("{}", render_human_summary(&report));
    println!("JSON report: {}", args.report.display());

    if report.passed { Ok(0) } else { Ok(1) }
}

pub(super) fn run_apply_command(config_path: &Path, args: ApplyArgs) -> Result<i32, CliError> {
    let mut directives = args.directives;
    for parameter in &args.parameters {
        let (key, value) = parameter
            .split_once('=')
            .ok_or_else(|| CliError::Usage(format!("--param '{parameter}' must be KEY=VALUE")))?;
        directives.push(format!("Parameter:name:{key}={value}").parse::<SubstitutionDirective>()?);
    }

    let mut request = TemplateRequest::new(args.template, args.output_dir).directives(directives);
    if let Some(name) = args.output_name {
        request = request.output_name(name);
    }
    if args.restart {
        let policy = load_optional_config(config_path)?
            .map(|config| config.restart_policy())
            .unwrap_or_else(RestartPolicy::default);
        request = request.restart(policy);
    }

    let derived = template::apply(&request)?;
    println!("{}", derived.display());
    Ok(0)
}

pub(super) fn run_extract_command(args: ExtractArgs) -> Result<i32, CliError> {
    let text = read_capture(&args.input)?;
    let values = extract(&args.label, &text)?;
    if !values.is_empty() {
        println!("{}", format_values(&values));
    }

    if let Some(expected) = &args.expect {
        assert_close_labeled(args.label.trim(), &values, expected, args.rel_tol)
            .map_err(goldrun_core::domain::HarnessError::from)?;
    }
    Ok(0)
}
