//! Manifest-driven scenario suites: tier selection, per-scenario runs and reports.

mod model;
mod runner;

pub use model::{
    ChannelAssertion, ConvergenceStudy, RefinementLevel, ScenarioClass, ScenarioDefinition,
    ScenarioManifest, ScenarioVariant, TierTable,
};
pub use runner::{
    ScenarioReport, ScenarioStatus, SuiteConfig, SuiteReport, render_human_summary, run_suite,
    run_suite_with_runner, write_report,
};
