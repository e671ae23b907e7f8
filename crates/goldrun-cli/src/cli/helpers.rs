use anyhow::Context;
use goldrun_core::config::HarnessConfig;
use goldrun_core::domain::HarnessResult;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// `-v` flags win over `RUST_LOG`; without either only warnings reach stderr.
pub(super) fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub(super) fn load_config(path: &Path) -> HarnessResult<HarnessConfig> {
    tracing::debug!(config = %path.display(), "loading harness config");
    HarnessConfig::load(path)
}

/// The harness config is only needed by `apply` for restart conventions.
pub(super) fn load_optional_config(path: &Path) -> HarnessResult<Option<HarnessConfig>> {
    if path.is_file() {
        load_config(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Reads a console capture from `path`, or stdin when `path` is `-`.
pub(super) fn read_capture(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read console capture from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path)
        .with_context(|| format!("failed to read console capture '{}'", path.display()))
}

pub(super) fn format_values(values: &[f64]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
