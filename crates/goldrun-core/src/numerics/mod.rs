//! Relative-tolerance comparison of console values and convergence error norms.
//!
//! Tolerances always come from the caller; nothing here picks a default.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativeComparison {
    pub abs_diff: f64,
    pub rel_diff: f64,
    pub passes: bool,
}

/// `|observed - expected| <= rel_tol * |expected|`, or exact equality when the
/// expected value is zero. NaN on either side never passes.
pub fn compare_relative(observed: f64, expected: f64, rel_tol: f64) -> RelativeComparison {
    let abs_diff = (observed - expected).abs();
    if expected == 0.0 {
        let passes = observed == 0.0;
        return RelativeComparison {
            abs_diff,
            rel_diff: if passes { 0.0 } else { f64::INFINITY },
            passes,
        };
    }

    let scale = expected.abs();
    RelativeComparison {
        abs_diff,
        rel_diff: abs_diff / scale,
        passes: abs_diff <= rel_tol * scale,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueMismatch {
    pub location: String,
    pub observed: f64,
    pub expected: f64,
    pub relative_error: f64,
    pub tolerance: f64,
}

impl Display for ValueMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: observed {:e}, expected {:e} (relative error {:e} exceeds tolerance {:e})",
            self.location, self.observed, self.expected, self.relative_error, self.tolerance
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConvergenceMismatch {
    Value(ValueMismatch),
    Shape { location: String, message: String },
}

impl ConvergenceMismatch {
    pub fn level(&self) -> Option<usize> {
        let location = match self {
            Self::Value(mismatch) => &mismatch.location,
            Self::Shape { location, .. } => location,
        };
        location
            .strip_prefix("level ")
            .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|digits| digits.parse().ok())
    }
}

impl Display for ConvergenceMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(mismatch) => mismatch.fmt(f),
            Self::Shape { location, message } => write!(f, "{location}: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComparisonFailure {
    #[error("{label}: expected {expected} values, observed {observed}")]
    Length {
        label: String,
        observed: usize,
        expected: usize,
    },
    #[error("{0}")]
    Value(ValueMismatch),
    #[error("convergence check failed at {} entries:\n  {}", failures.len(), render_failures(failures))]
    Convergence { failures: Vec<ConvergenceMismatch> },
}

fn render_failures(failures: &[ConvergenceMismatch]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}

pub fn assert_close(
    observed: &[f64],
    expected: &[f64],
    rel_tol: f64,
) -> Result<(), ComparisonFailure> {
    assert_close_labeled("values", observed, expected, rel_tol)
}

/// Fails on a length mismatch, otherwise on the first index outside tolerance.
pub fn assert_close_labeled(
    label: &str,
    observed: &[f64],
    expected: &[f64],
    rel_tol: f64,
) -> Result<(), ComparisonFailure> {
    if observed.len() != expected.len() {
        return Err(ComparisonFailure::Length {
            label: label.to_string(),
            observed: observed.len(),
            expected: expected.len(),
        });
    }

    for (index, (&observed, &expected)) in observed.iter().zip(expected).enumerate() {
        let comparison = compare_relative(observed, expected, rel_tol);
        if !comparison.passes {
            return Err(ComparisonFailure::Value(ValueMismatch {
                location: format!("{label}[{index}]"),
                observed,
                expected,
                relative_error: comparison.rel_diff,
                tolerance: rel_tol,
            }));
        }
    }

    Ok(())
}

/// One refinement level of an error-norm matrix, nested to any depth.
///
/// `null` in JSON is the "no comparison" sentinel.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NormTree {
    Skip,
    Value(f64),
    Nested(Vec<NormTree>),
}

impl NormTree {
    pub fn nested(values: impl IntoIterator<Item = NormTree>) -> Self {
        Self::Nested(values.into_iter().collect())
    }

    pub fn values(values: &[f64]) -> Self {
        Self::Nested(values.iter().copied().map(Self::Value).collect())
    }

    fn shape_name(&self) -> &'static str {
        match self {
            Self::Skip => "no value",
            Self::Value(_) => "a scalar",
            Self::Nested(_) => "a list",
        }
    }
}

impl From<f64> for NormTree {
    fn from(value: f64) -> Self {
        Self::Value(value)
    }
}

impl From<Option<f64>> for NormTree {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Skip, Self::Value)
    }
}

/// Compares observed error norms against a reference matrix level by level.
///
/// Observed levels may be a prefix of the reference (lower tiers run fewer
/// refinements). Every failing entry is reported, not only the first.
pub fn assert_convergence(
    observed: &[NormTree],
    expected: &[NormTree],
    rel_tol: f64,
) -> Result<(), ComparisonFailure> {
    let mut failures = Vec::new();
    if observed.len() > expected.len() {
        failures.push(ConvergenceMismatch::Shape {
            location: "matrix".to_string(),
            message: format!(
                "{} refinement levels observed but the reference only has {}",
                observed.len(),
                expected.len()
            ),
        });
    }

    for (level, (observed, expected)) in observed.iter().zip(expected).enumerate() {
        let mut location = format!("level {level}");
        compare_tree(&mut location, observed, expected, rel_tol, &mut failures);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ComparisonFailure::Convergence { failures })
    }
}

fn compare_tree(
    location: &mut String,
    observed: &NormTree,
    expected: &NormTree,
    rel_tol: f64,
    failures: &mut Vec<ConvergenceMismatch>,
) {
    match (observed, expected) {
        (_, NormTree::Skip) => {}
        (NormTree::Value(observed), NormTree::Value(expected)) => {
            let comparison = compare_relative(*observed, *expected, rel_tol);
            if !comparison.passes {
                failures.push(ConvergenceMismatch::Value(ValueMismatch {
                    location: location.clone(),
                    observed: *observed,
                    expected: *expected,
                    relative_error: comparison.rel_diff,
                    tolerance: rel_tol,
                }));
            }
        }
        (NormTree::Nested(observed), NormTree::Nested(expected)) => {
            if observed.len() != expected.len() {
                failures.push(ConvergenceMismatch::Shape {
                    location: location.clone(),
                    message: format!(
                        "expected {} entries, observed {}",
                        expected.len(),
                        observed.len()
                    ),
                });
                return;
            }
            for (index, (observed, expected)) in observed.iter().zip(expected).enumerate() {
                let restore = location.len();
                location.push_str(&format!("[{index}]"));
                compare_tree(location, observed, expected, rel_tol, failures);
                location.truncate(restore);
            }
        }
        (observed, expected) => failures.push(ConvergenceMismatch::Shape {
            location: location.clone(),
            message: format!(
                "expected {}, observed {}",
                expected.shape_name(),
                observed.shape_name()
            ),
        }),
    }
}
