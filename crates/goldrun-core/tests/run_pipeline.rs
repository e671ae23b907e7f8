#![cfg(unix)]

use goldrun_core::config::HarnessConfig;
use goldrun_core::domain::{HarnessError, SubstitutionDirective};
use goldrun_core::numerics::assert_close;
use goldrun_core::orchestrator::{RunOrchestrator, RunRequest};
use goldrun_core::parser::extract;
use goldrun_core::template::{self, TemplateRequest};
use goldrun_core::workdir::TestContext;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CAVITY: &str = r#"<ParameterList name="Main">
  <!-- lid-driven cavity -->
  <ParameterList name="Physics">
    <Parameter name="Kinematic viscosity" type="double" value="0.8"/>
  </ParameterList>
  <ParameterList name="Output">
    <Parameter name="Exodus Output File" type="string" value="cavity.e"/>
  </ParameterList>
</ParameterList>
"#;

const SOLVER: &str = r#"#!/bin/sh
doc="$1"
out=$(sed -n 's/.*name="Exodus Output File"[^>]*value="\([^"]*\)".*/\1/p' "$doc")
nu=$(sed -n 's/.*name="Kinematic viscosity"[^>]*value="\([^"]*\)".*/\1/p' "$doc")
printf 'viscosity %s\n' "$nu" > "$out"
echo "  Inlet - velocity_0 = 0.000600000000"
echo "  Inlet - velocity_0 = 0.000600000000"
"#;

const FAILING_SOLVER: &str = "#!/bin/sh\necho 'assembling' 1>&2\necho 'FATAL: singular matrix' 1>&2\nexit 3\n";

const DIFF: &str = "#!/bin/sh\ncmp -s \"$1\" \"$2\"\n";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("script should be written");
    let mut permissions = fs::metadata(&path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("script should be executable");
    path
}

struct Fixture {
    _bin: TempDir,
    test_dir: TempDir,
    config: HarnessConfig,
}

fn fixture(solver_body: &str, diff_body: &str) -> Fixture {
    let bin = TempDir::new().expect("bin dir should be created");
    let test_dir = TempDir::new().expect("test dir should be created");
    let solver = write_script(bin.path(), "solver", solver_body);
    let diff = write_script(bin.path(), "exodiff", diff_body);

    fs::write(test_dir.path().join("cavity.xml"), CAVITY).expect("template should be written");
    fs::create_dir(test_dir.path().join("gold")).expect("gold dir should be created");
    fs::write(test_dir.path().join("gold/cavity.e"), "viscosity 0.2\n").expect("gold should be written");

    let mut config = HarnessConfig::new(solver, diff);
    config.input_dir = test_dir.path().to_path_buf();
    Fixture {
        _bin: bin,
        test_dir,
        config,
    }
}

#[test]
fn derived_viscosity_run_matches_its_gold_artifact() {
    let fixture = fixture(SOLVER, DIFF);
    let test_dir = fixture.test_dir.path();
    let mut context = TestContext::new(test_dir, &fixture.config);

    let derived = template::apply(
        &TemplateRequest::new(test_dir.join("cavity.xml"), test_dir)
            .directives([SubstitutionDirective::parameter("Kinematic viscosity", 0.2)]),
    )
    .expect("template should apply");
    let derived = context.track(derived);
    let text = fs::read_to_string(&derived).expect("derived document should be readable");
    assert!(text.contains(r#"<Parameter name="Kinematic viscosity" type="double" value="0.2"/>"#));
    assert!(text.contains("<!-- lid-driven cavity -->"));
    assert!(fs::read_to_string(test_dir.join("cavity.xml")).expect("base readable").contains("value=\"0.8\""));

    let orchestrator = RunOrchestrator::new(fixture.config.clone());
    let result = orchestrator
        .run(&mut context, &RunRequest::new(&derived))
        .expect("run should match gold");
    assert_eq!(result.solver_status, 0);
    assert_eq!(result.diff_status, Some(0));

    let velocities = extract("  Inlet - velocity_0 = ", &result.stdout).expect("channel should parse");
    assert_close(&velocities, &[0.0006, 0.0006], 1e-10).expect("velocities should match");

    let report = context.cleanup();
    assert!(report.is_clean());
    assert!(!derived.exists());
    assert!(!test_dir.join("cavity.e").exists());
    assert!(test_dir.join("cavity.xml").exists());
    assert!(test_dir.join("gold/cavity.e").exists());
}

#[test]
fn unmodified_template_differs_from_gold() {
    let fixture = fixture(SOLVER, DIFF);
    let test_dir = fixture.test_dir.path();
    let mut context = TestContext::new(test_dir, &fixture.config);

    let error = RunOrchestrator::new(fixture.config.clone())
        .run(&mut context, &RunRequest::new("cavity.xml"))
        .expect_err("viscosity 0.8 should not match the 0.2 gold");
    assert!(matches!(error, HarnessError::ArtifactMismatch { status: 1, .. }));
}

#[test]
fn solver_failure_never_reaches_the_diff_tool() {
    let diff_marker = "#!/bin/sh\ntouch \"$(dirname \"$1\")/diff_called\"\n";
    let fixture = fixture(FAILING_SOLVER, diff_marker);
    let test_dir = fixture.test_dir.path();
    let mut context = TestContext::new(test_dir, &fixture.config);

    let error = RunOrchestrator::new(fixture.config.clone())
        .run(&mut context, &RunRequest::new("cavity.xml"))
        .expect_err("solver failure should raise");
    match &error {
        HarnessError::SolverExecution {
            status,
            stderr_tail,
            ..
        } => {
            assert_eq!(*status, 3);
            assert_eq!(stderr_tail, "assembling\nFATAL: singular matrix");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(error.exit_code(), 1);
    assert!(!test_dir.join("diff_called").exists());
}

#[test]
fn missing_directive_writes_nothing() {
    let fixture = fixture(SOLVER, DIFF);
    let test_dir = fixture.test_dir.path();
    let before = fs::read_dir(test_dir).expect("test dir readable").count();

    let error = template::apply(
        &TemplateRequest::new(test_dir.join("cavity.xml"), test_dir)
            .directives([SubstitutionDirective::parameter("Density", 1.0)]),
    )
    .expect_err("unknown parameter should fail");
    assert_eq!(error.placeholder(), "TEMPLATE.DIRECTIVE_NOT_FOUND");
    assert_eq!(fs::read_dir(test_dir).expect("test dir readable").count(), before);
}
