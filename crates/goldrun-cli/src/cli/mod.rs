mod commands;
mod helpers;

use clap::Parser;
use goldrun_core::config::DEFAULT_CONFIG_PATH;
use goldrun_core::domain::{HarnessError, HarnessErrorCategory};
use std::path::PathBuf;

pub fn run_from_env() -> i32 {
    run(std::env::args().skip(1)).unwrap_or_else(|error| {
        for line in error.diagnostic_lines() {
            eprintln!("{line}");
        }
        error.exit_code()
    })
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("goldrun".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    match Cli::try_parse_from(&full_args) {
        Ok(cli) => {
            helpers::init_tracing(cli.verbose);
            dispatch_parsed(cli.config, cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{err}");
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(name = "goldrun", about = "Gold-standard regression harness for external solvers")]
struct Cli {
    /// Harness configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Run the scenario suite for one regression tier
    Regression(commands::RegressionArgs),
    /// Derive a configuration document from a template
    Apply(commands::ApplyArgs),
    /// Extract a numeric channel from captured console output
    Extract(commands::ExtractArgs),
}

fn dispatch_parsed(config: PathBuf, command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Regression(args) => commands::run_regression_command(&config, args),
        CliCommand::Apply(args) => commands::run_apply_command(&config, args),
        CliCommand::Extract(args) => commands::run_extract_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => HarnessErrorCategory::InputValidation.exit_code(),
            Self::Harness(error) => error.exit_code(),
            Self::Internal(_) => HarnessErrorCategory::Internal.exit_code(),
        }
    }

    fn diagnostic_lines(&self) -> Vec<String> {
        match self {
            Self::Usage(message) => vec![
                format!("ERROR: [INPUT.CLI_USAGE] {}", message.trim_end()),
                format!("FATAL EXIT CODE: {}", self.exit_code()),
            ],
            Self::Harness(error) => vec![error.diagnostic_line(), error.fatal_exit_line()],
            Self::Internal(error) => vec![
                format!("ERROR: [INTERNAL.CLI] {error:#}"),
                format!("FATAL EXIT CODE: {}", self.exit_code()),
            ],
        }
    }
}
