use super::model::{
    RefinementLevel, ScenarioClass, ScenarioDefinition, ScenarioManifest, ScenarioVariant,
};
use crate::config::HarnessConfig;
use crate::domain::{
    DEFAULT_VALUE_ATTRIBUTE, HarnessError, HarnessResult, RunResult, SubstitutionDirective, Tier,
};
use crate::numerics::{assert_close_labeled, assert_convergence};
use crate::orchestrator::{
    ProcessRunner, RunOrchestrator, RunRequest, SystemProcessRunner, accelerator_variant,
};
use crate::parser::{ChannelCatalog, collect_error_norms};
use crate::template::{self, TemplateRequest};
use crate::workdir::{CleanupFailure, DirectoryScope, TestContext};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub manifest_path: PathBuf,
    pub harness: HarnessConfig,
    pub tier: Tier,
    pub accelerator: bool,
    /// Substring matched against `class/scenario`.
    pub filter: Option<String>,
    pub report_path: Option<PathBuf>,
}

impl SuiteConfig {
    pub fn new(manifest_path: impl Into<PathBuf>, harness: HarnessConfig, tier: Tier) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            harness,
            tier,
            accelerator: false,
            filter: None,
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub class: String,
    pub id: String,
    pub status: ScenarioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub solver_runs: usize,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl ScenarioReport {
    fn skipped(class: &str, id: &str, reason: impl Into<String>) -> Self {
        Self {
            class: class.to_string(),
            id: id.to_string(),
            status: ScenarioStatus::Skipped,
            error_code: None,
            message: Some(reason.into()),
            solver_runs: 0,
            elapsed_seconds: 0.0,
            cleanup_failures: Vec::new(),
        }
    }

    fn failed(class: &str, id: &str, error: &HarnessError) -> Self {
        Self {
            class: class.to_string(),
            id: id.to_string(),
            status: ScenarioStatus::Failed,
            error_code: Some(error.placeholder().to_string()),
            message: Some(error.to_string()),
            solver_runs: 0,
            elapsed_seconds: 0.0,
            cleanup_failures: Vec::new(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.class, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    pub tier: Tier,
    pub accelerator: bool,
    pub passed: bool,
    pub total: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    fn from_scenarios(tier: Tier, accelerator: bool, scenarios: Vec<ScenarioReport>) -> Self {
        let count = |status| scenarios.iter().filter(|report| report.status == status).count();
        let passed_count = count(ScenarioStatus::Passed);
        let failed_count = count(ScenarioStatus::Failed);
        let skipped_count = count(ScenarioStatus::Skipped);
        Self {
            tier,
            accelerator,
            passed: failed_count == 0,
            total: scenarios.len(),
            passed_count,
            failed_count,
            skipped_count,
            scenarios,
        }
    }
}

pub fn run_suite(config: &SuiteConfig) -> HarnessResult<SuiteReport> {
    run_suite_with_runner(config, SystemProcessRunner::default())
}

/// Runs every selected scenario of the manifest for the configured tier.
///
/// Scenario failures are recorded in the report; only manifest and report
/// problems are returned as errors.
pub fn run_suite_with_runner<R: ProcessRunner>(
    config: &SuiteConfig,
    runner: R,
) -> HarnessResult<SuiteReport> {
    let manifest_path = std::path::absolute(&config.manifest_path).map_err(|source| {
        HarnessError::io("failed to resolve manifest path", &config.manifest_path, source)
    })?;
    let manifest = ScenarioManifest::load(&manifest_path)?;
    let manifest_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let orchestrator = RunOrchestrator::with_runner(config.harness.clone(), runner);

    tracing::info!(
        manifest = %manifest_path.display(),
        tier = %config.tier,
        accelerator = config.accelerator,
        "starting scenario suite"
    );

    let mut reports = Vec::new();
    for class in &manifest.classes {
        let chosen = class
            .scenarios
            .iter()
            .filter(|scenario| selected(config, class, scenario))
            .collect::<Vec<_>>();
        if chosen.is_empty() {
            continue;
        }
        run_class(
            config,
            &manifest.channels,
            &orchestrator,
            class,
            &manifest_dir.join(&class.directory),
            &chosen,
            &mut reports,
        );
    }

    let report = SuiteReport::from_scenarios(config.tier, config.accelerator, reports);
    if let Some(path) = &config.report_path {
        write_report(&report, path)?;
    }
    Ok(report)
}

fn selected(config: &SuiteConfig, class: &ScenarioClass, scenario: &ScenarioDefinition) -> bool {
    config
        .filter
        .as_deref()
        .is_none_or(|filter| format!("{}/{}", class.name, scenario.id).contains(filter))
}

fn run_class<R: ProcessRunner>(
    config: &SuiteConfig,
    catalog: &ChannelCatalog,
    orchestrator: &RunOrchestrator<R>,
    class: &ScenarioClass,
    class_dir: &Path,
    scenarios: &[&ScenarioDefinition],
    reports: &mut Vec<ScenarioReport>,
) {
    let scope = match DirectoryScope::enter(class_dir) {
        Ok(scope) => scope,
        Err(error) => {
            tracing::warn!(class = %class.name, %error, "cannot enter class directory");
            reports.extend(
                scenarios
                    .iter()
                    .map(|scenario| ScenarioReport::failed(&class.name, &scenario.id, &error)),
            );
            return;
        }
    };

    for scenario in scenarios {
        let report = run_scenario(config, catalog, orchestrator, class, class_dir, scenario);
        match report.status {
            ScenarioStatus::Passed => tracing::info!(scenario = %report.name(), "scenario passed"),
            ScenarioStatus::Failed => tracing::info!(
                scenario = %report.name(),
                code = report.error_code.as_deref().unwrap_or_default(),
                "scenario failed"
            ),
            ScenarioStatus::Skipped => tracing::debug!(scenario = %report.name(), "scenario skipped"),
        }
        reports.push(report);
    }

    if let Err(error) = scope.leave() {
        tracing::warn!(class = %class.name, %error, "failed to leave class directory");
    }
}

fn run_scenario<R: ProcessRunner>(
    config: &SuiteConfig,
    catalog: &ChannelCatalog,
    orchestrator: &RunOrchestrator<R>,
    class: &ScenarioClass,
    class_dir: &Path,
    scenario: &ScenarioDefinition,
) -> ScenarioReport {
    if config.accelerator && !scenario.accelerator {
        return ScenarioReport::skipped(&class.name, &scenario.id, "no accelerator variant");
    }
    let variant = match scenario.variant_for(config.tier) {
        Ok(variant) => variant,
        Err(error) => return ScenarioReport::skipped(&class.name, &scenario.id, error.to_string()),
    };

    let started = Instant::now();
    let mut context = TestContext::new(class_dir, &config.harness);
    let mut execution = ScenarioExecution {
        config,
        catalog,
        orchestrator,
        scenario,
        variant,
        solver_runs: 0,
    };
    let outcome = execution.execute(&mut context);
    let cleanup = context.cleanup();

    let mut report = match outcome {
        Ok(()) => ScenarioReport {
            class: class.name.clone(),
            id: scenario.id.clone(),
            status: ScenarioStatus::Passed,
            error_code: None,
            message: None,
            solver_runs: 0,
            elapsed_seconds: 0.0,
            cleanup_failures: Vec::new(),
        },
        Err(error) => ScenarioReport::failed(&class.name, &scenario.id, &error),
    };
    report.solver_runs = execution.solver_runs;
    report.elapsed_seconds = started.elapsed().as_secs_f64();
    report.cleanup_failures = cleanup.failures;
    report
}

struct ScenarioExecution<'a, R> {
    config: &'a SuiteConfig,
    catalog: &'a ChannelCatalog,
    orchestrator: &'a RunOrchestrator<R>,
    scenario: &'a ScenarioDefinition,
    variant: Option<&'a ScenarioVariant>,
    solver_runs: usize,
}

impl<R: ProcessRunner> ScenarioExecution<'_, R> {
    fn execute(&mut self, context: &mut TestContext) -> HarnessResult<()> {
        for pattern in &self.scenario.track_patterns {
            context.track_pattern(pattern)?;
        }

        let scenario = self.scenario;
        let directives = self.base_directives();
        let Some(study) = &scenario.convergence else {
            let result = self.run_once(context, &directives, scenario.compare_to_gold)?;
            return self.check_channels(&result);
        };

        let levels = self
            .variant
            .map(|variant| variant.levels.as_slice())
            .unwrap_or_default();
        let mut observed = Vec::new();
        let mut last = None;
        if levels.is_empty() {
            let result = self.run_once(context, &directives, false)?;
            observed.push(collect_error_norms(&study.norms, self.catalog, &result.stdout)?);
            last = Some(result);
        }
        for (index, level) in levels.iter().enumerate() {
            let level_directives = self.level_directives(context, &directives, level, index)?;
            let result = self.run_once(context, &level_directives, false)?;
            observed.push(collect_error_norms(&study.norms, self.catalog, &result.stdout)?);
            tracing::debug!(scenario = %scenario.id, level = index, "refinement level finished");
            last = Some(result);
        }

        assert_convergence(&observed, &study.reference, study.rel_tol)?;
        match last {
            Some(result) => self.check_channels(&result),
            None => Ok(()),
        }
    }

    fn base_directives(&self) -> Vec<SubstitutionDirective> {
        let mut directives = self.scenario.directives.clone();
        if let Some(variant) = self.variant {
            directives.extend(variant.directives.iter().cloned());
            if let Some(output) = &variant.output {
                directives.push(SubstitutionDirective::for_target(
                    self.config.harness.output_field.clone(),
                    output.as_str(),
                ));
            }
        }
        directives
    }

    /// Each level writes its own artifact unless its directives already name one.
    fn level_directives(
        &self,
        context: &TestContext,
        directives: &[SubstitutionDirective],
        level: &RefinementLevel,
        index: usize,
    ) -> HarnessResult<Vec<SubstitutionDirective>> {
        let output_field = &self.config.harness.output_field;
        let mut combined = directives.to_vec();
        combined.extend(level.directives.iter().cloned());
        if level
            .directives
            .iter()
            .any(|directive| &directive.target == output_field)
        {
            return Ok(combined);
        }

        let declared = match directives
            .iter()
            .rev()
            .find(|directive| &directive.target == output_field)
        {
            Some(directive) => Some(directive.value.render()),
            None => template::read_value_from_path(
                &self.template_path(context),
                output_field,
                DEFAULT_VALUE_ATTRIBUTE,
            )?,
        };
        if let Some(name) = declared.filter(|name| !name.trim().is_empty()) {
            combined.push(SubstitutionDirective::for_target(
                output_field.clone(),
                level_output_name(&name, index),
            ));
        }
        Ok(combined)
    }

    /// The scenario's template, or its accelerator variant in accelerator runs.
    fn template_path(&self, context: &TestContext) -> PathBuf {
        let template = context.resolve_template(&self.scenario.base_input);
        match self.config.harness.accelerator.as_ref() {
            Some(accelerator) if self.config.accelerator => accelerator_variant(&template, accelerator),
            _ => template,
        }
    }

    fn run_once(
        &mut self,
        context: &mut TestContext,
        directives: &[SubstitutionDirective],
        compare_to_gold: bool,
    ) -> HarnessResult<RunResult> {
        let scenario = self.scenario;
        let (document, copy_input) = if directives.is_empty() && !scenario.restart {
            if scenario.copy_input {
                (scenario.base_input.clone(), true)
            } else {
                (context.resolve_template(&scenario.base_input), false)
            }
        } else {
            let mut request = TemplateRequest::new(self.template_path(context), context.test_dir())
                .directives(directives.iter().cloned());
            if scenario.restart {
                request = request.restart(self.config.harness.restart_policy());
            }
            let derived = template::apply(&request)?;
            (context.track(derived), false)
        };

        let request = RunRequest::new(document)
            .solver_flags(scenario.solver_flags.iter().cloned())
            .diff_flags(scenario.diff_flags.iter().cloned())
            .compare_to_gold(compare_to_gold)
            .use_accelerator(self.config.accelerator)
            .copy_input(copy_input);
        self.solver_runs += 1;
        self.orchestrator.run(context, &request)
    }

    fn check_channels(&self, result: &RunResult) -> HarnessResult<()> {
        for assertion in &self.scenario.channels {
            let values = self.catalog.extract_named(&assertion.channel, &result.stdout)?;
            assert_close_labeled(&assertion.channel, &values, &assertion.expected, assertion.rel_tol)
                .map_err(HarnessError::from)?;
        }
        Ok(())
    }
}

/// `<stem>_level<N>.<ext>` for refinement level `level` of artifact `name`.
fn level_output_name(name: &str, level: usize) -> String {
    let path = Path::new(name);
    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return format!("{name}_level{level}");
    };
    let file_name = match path.extension().and_then(|extension| extension.to_str()) {
        Some(extension) => format!("{stem}_level{level}.{extension}"),
        None => format!("{stem}_level{level}"),
    };
    path.with_file_name(file_name).to_string_lossy().into_owned()
}

pub fn write_report(report: &SuiteReport, path: &Path) -> HarnessResult<()> {
    let report_error = |message: String| HarnessError::Report {
        path: path.to_path_buf(),
        message,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| report_error(error.to_string()))?;
    }
    let json = serde_json::to_string_pretty(report).map_err(|error| report_error(error.to_string()))?;
    fs::write(path, json).map_err(|error| report_error(error.to_string()))
}

pub fn render_human_summary(report: &SuiteReport) -> String {
    let mode = if report.accelerator { "accelerator" } else { "host" };
    let mut lines = vec![
        format!("Tier: {} ({mode})", report.tier),
        format!(
            "Scenarios: {} total, {} passed, {} failed, {} skipped",
            report.total, report.passed_count, report.failed_count, report.skipped_count
        ),
    ];
    for scenario in &report.scenarios {
        match scenario.status {
            ScenarioStatus::Passed => lines.push(format!(
                "PASS {} ({} runs, {:.1}s)",
                scenario.name(),
                scenario.solver_runs,
                scenario.elapsed_seconds
            )),
            ScenarioStatus::Failed => lines.push(format!(
                "FAIL {}: ERROR: [{}] {}",
                scenario.name(),
                scenario.error_code.as_deref().unwrap_or("UNKNOWN"),
                scenario.message.as_deref().unwrap_or_default()
            )),
            ScenarioStatus::Skipped => lines.push(format!(
                "SKIP {}: {}",
                scenario.name(),
                scenario.message.as_deref().unwrap_or_default()
            )),
        }
        for failure in &scenario.cleanup_failures {
            lines.push(format!(
                "  cleanup: could not remove '{}': {}",
                failure.path.display(),
                failure.message
            ));
        }
    }
    lines.push(format!(
        "Result: {}",
        if report.passed { "PASS" } else { "FAIL" }
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{
        ScenarioReport, ScenarioStatus, SuiteReport, level_output_name, render_human_summary,
        write_report,
    };
    use crate::domain::{HarnessError, Tier};
    use crate::workdir::CleanupFailure;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_report() -> SuiteReport {
        let mut passed = ScenarioReport::skipped("cavity", "re_100", "");
        passed.status = ScenarioStatus::Passed;
        passed.message = None;
        passed.solver_runs = 1;
        passed.elapsed_seconds = 2.5;

        let mut failed = ScenarioReport::failed(
            "cavity",
            "re_400",
            &HarnessError::ReferenceArtifactMissing {
                path: PathBuf::from("gold/cavity_400.e"),
            },
        );
        failed.cleanup_failures.push(CleanupFailure {
            path: PathBuf::from("cavity_400.e"),
            message: "permission denied".to_string(),
        });

        let skipped = ScenarioReport::skipped("tgv", "convergence", "scenario 'convergence' has no variant for tier 'push'");
        SuiteReport::from_scenarios(Tier::Push, false, vec![passed, failed, skipped])
    }

    #[test]
    fn counts_and_verdict_follow_scenario_statuses() {
        let report = sample_report();
        assert_eq!(report.total, 3);
        assert_eq!(report.passed_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.skipped_count, 1);
        assert!(!report.passed);

        let all_skipped = SuiteReport::from_scenarios(
            Tier::Daily,
            true,
            vec![ScenarioReport::skipped("cavity", "re_100", "no accelerator variant")],
        );
        assert!(all_skipped.passed);
    }

    #[test]
    fn human_summary_lists_each_scenario() {
        let summary = render_human_summary(&sample_report());
        assert!(summary.starts_with("Tier: push (host)\nScenarios: 3 total, 1 passed, 1 failed, 1 skipped"));
        assert!(summary.contains("PASS cavity/re_100 (1 runs, 2.5s)"));
        assert!(summary.contains(
            "FAIL cavity/re_400: ERROR: [RUN.REFERENCE_MISSING] reference artifact 'gold/cavity_400.e' does not exist"
        ));
        assert!(summary.contains("  cleanup: could not remove 'cavity_400.e': permission denied"));
        assert!(summary.contains("SKIP tgv/convergence: scenario 'convergence' has no variant for tier 'push'"));
        assert!(summary.ends_with("Result: FAIL"));
    }

    #[test]
    fn json_report_uses_camel_case_and_lowercase_statuses() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("reports/suite.json");
        write_report(&sample_report(), &path).expect("report should be written");

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&path).expect("report should be readable"),
        )
        .expect("report should be valid JSON");
        assert_eq!(json["tier"], "push");
        assert_eq!(json["failedCount"], 1);
        assert_eq!(json["scenarios"][1]["status"], "failed");
        assert_eq!(json["scenarios"][1]["errorCode"], "RUN.REFERENCE_MISSING");
        assert!(json["scenarios"][0].get("errorCode").is_none());
    }

    #[test]
    fn refinement_levels_get_their_own_artifact_names() {
        assert_eq!(level_output_name("hartmann.exo", 0), "hartmann_level0.exo");
        assert_eq!(level_output_name("results/channel.e", 2), "results/channel_level2.e");
        assert_eq!(level_output_name("solution", 1), "solution_level1");
    }
}
