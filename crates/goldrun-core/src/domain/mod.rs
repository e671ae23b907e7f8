pub mod errors;

pub use errors::{HarnessError, HarnessErrorCategory, HarnessResult};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_VALUE_ATTRIBUTE: &str = "value";

/// Identifies one node of a configuration document by tag and keying attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DirectiveTarget {
    pub tag: String,
    pub attribute: String,
    pub key: String,
}

impl DirectiveTarget {
    pub fn new(
        tag: impl Into<String>,
        attribute: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            attribute: attribute.into(),
            key: key.into(),
        }
    }

    /// `<Parameter name="...">`, the keying used by every solver input deck.
    pub fn parameter(key: impl Into<String>) -> Self {
        Self::new("Parameter", "name", key)
    }
}

impl Display for DirectiveTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} {}=\"{}\">", self.tag, self.attribute, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DirectiveValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Vector(Vec<f64>),
    Text(String),
}

impl DirectiveValue {
    /// Textual form written into the document.
    ///
    /// Floats never use exponent notation and always keep a decimal point so the
    /// solver reads them back as doubles; vectors are brace-delimited.
    pub fn render(&self) -> String {
        match self {
            Self::Boolean(value) => value.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => render_float(*value),
            Self::Vector(values) => {
                let items = values
                    .iter()
                    .map(|value| render_float(*value))
                    .collect::<Vec<_>>();
                format!("{{{}}}", items.join(", "))
            }
            Self::Text(value) => value.clone(),
        }
    }

    /// Interprets a command-line literal: integer, float, boolean, `{a, b}` vector,
    /// otherwise text.
    pub fn parse_literal(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(value) = trimmed.parse::<i64>() {
            return Self::Integer(value);
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            return Self::Float(value);
        }
        match trimmed {
            "true" => return Self::Boolean(true),
            "false" => return Self::Boolean(false),
            _ => {}
        }
        if let Some(inner) = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            let parsed = inner
                .split(',')
                .map(|item| item.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>();
            if let Ok(values) = parsed {
                return Self::Vector(values);
            }
        }
        Self::Text(text.to_string())
    }
}

fn render_float(value: f64) -> String {
    let mut rendered = value.to_string();
    if value.is_finite() && !rendered.contains('.') {
        rendered.push_str(".0");
    }
    rendered
}

impl From<i64> for DirectiveValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for DirectiveValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for DirectiveValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for DirectiveValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for DirectiveValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for DirectiveValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for DirectiveValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<f64>> for DirectiveValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Vector(values)
    }
}

impl<const N: usize> From<[f64; N]> for DirectiveValue {
    fn from(values: [f64; N]) -> Self {
        Self::Vector(values.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstitutionDirective {
    #[serde(flatten)]
    pub target: DirectiveTarget,
    #[serde(default = "default_value_attribute")]
    pub value_attribute: String,
    pub value: DirectiveValue,
}

fn default_value_attribute() -> String {
    DEFAULT_VALUE_ATTRIBUTE.to_string()
}

impl SubstitutionDirective {
    pub fn new(
        tag: impl Into<String>,
        attribute: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<DirectiveValue>,
    ) -> Self {
        Self::for_target(DirectiveTarget::new(tag, attribute, key), value)
    }

    pub fn for_target(target: DirectiveTarget, value: impl Into<DirectiveValue>) -> Self {
        Self {
            target,
            value_attribute: default_value_attribute(),
            value: value.into(),
        }
    }

    pub fn parameter(key: impl Into<String>, value: impl Into<DirectiveValue>) -> Self {
        Self::for_target(DirectiveTarget::parameter(key), value)
    }

    pub fn with_value_attribute(mut self, value_attribute: impl Into<String>) -> Self {
        self.value_attribute = value_attribute.into();
        self
    }
}

impl Display for SubstitutionDirective {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}={}",
            self.target,
            self.value_attribute,
            self.value.render()
        )
    }
}

/// Parses `TAG:ATTRIBUTE:KEY=VALUE`.
impl FromStr for SubstitutionDirective {
    type Err = HarnessError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| HarnessError::InvalidDirective {
            text: text.to_string(),
            reason: reason.to_string(),
        };
        let (selector, value) = text
            .split_once('=')
            .ok_or_else(|| invalid("expected TAG:ATTRIBUTE:KEY=VALUE"))?;
        let mut parts = selector.splitn(3, ':');
        let (Some(tag), Some(attribute), Some(key)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("selector must be TAG:ATTRIBUTE:KEY"));
        };
        if tag.is_empty() || attribute.is_empty() || key.is_empty() {
            return Err(invalid("tag, attribute and key must be non-empty"));
        }
        Ok(Self::new(
            tag,
            attribute,
            key,
            DirectiveValue::parse_literal(value),
        ))
    }
}

/// Regression cadence selecting which scenario variant runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Push,
    Daily,
    Weekly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Push, Tier::Daily, Tier::Weekly];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(text.trim()))
            .ok_or_else(|| format!("unknown tier '{text}'; expected push, daily or weekly"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub config_path: PathBuf,
    pub solver_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub solver_duration: Duration,
    pub produced_artifact: Option<PathBuf>,
    /// Absent when the run skipped the reference comparison.
    pub diff_status: Option<i32>,
    pub diff_stdout: Option<String>,
    pub diff_duration: Option<Duration>,
}

impl RunResult {
    pub fn compared_to_gold(&self) -> bool {
        self.diff_status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectiveTarget, DirectiveValue, SubstitutionDirective, Tier};

    #[test]
    fn floats_render_without_exponent_notation() {
        assert_eq!(DirectiveValue::from(0.2).render(), "0.2");
        assert_eq!(DirectiveValue::from(1.0e-10).render(), "0.0000000001");
        assert_eq!(DirectiveValue::from(50.0).render(), "50.0");
        assert_eq!(DirectiveValue::from(2.5e7).render(), "25000000.0");
        assert_eq!(DirectiveValue::from(20).render(), "20");
    }

    #[test]
    fn vectors_render_brace_delimited() {
        assert_eq!(
            DirectiveValue::from([0.0, 10.0, 0.0]).render(),
            "{0.0, 10.0, 0.0}"
        );
        assert_eq!(
            DirectiveValue::from(vec![0.04194528049, 0.0]).render(),
            "{0.04194528049, 0.0}"
        );
    }

    #[test]
    fn command_line_literals_keep_their_type() {
        assert_eq!(DirectiveValue::parse_literal("20"), DirectiveValue::Integer(20));
        assert_eq!(DirectiveValue::parse_literal("0.8"), DirectiveValue::Float(0.8));
        assert_eq!(
            DirectiveValue::parse_literal("{0.0, 0.1, 0.0}"),
            DirectiveValue::Vector(vec![0.0, 0.1, 0.0])
        );
        assert_eq!(
            DirectiveValue::parse_literal("cavity_solution.exo"),
            DirectiveValue::Text("cavity_solution.exo".to_string())
        );
        assert_eq!(DirectiveValue::parse_literal("true"), DirectiveValue::Boolean(true));
    }

    #[test]
    fn directive_parses_from_selector_syntax() {
        let directive: SubstitutionDirective = "Parameter:name:Kinematic viscosity=0.2"
            .parse()
            .expect("directive should parse");
        assert_eq!(
            directive.target,
            DirectiveTarget::parameter("Kinematic viscosity")
        );
        assert_eq!(directive.value, DirectiveValue::Float(0.2));
        assert_eq!(directive.value_attribute, "value");

        assert!("Parameter:name=0.2".parse::<SubstitutionDirective>().is_err());
        assert!("Parameter:name:X Elements".parse::<SubstitutionDirective>().is_err());
    }

    #[test]
    fn directives_deserialize_from_flat_json() {
        let directive: SubstitutionDirective = serde_json::from_str(
            r#"{ "tag": "Parameter", "attribute": "name", "key": "X Elements", "value": 40 }"#,
        )
        .expect("directive JSON should parse");
        assert_eq!(directive, SubstitutionDirective::parameter("X Elements", 40));
    }

    #[test]
    fn tiers_parse_case_insensitively() {
        assert_eq!("Weekly".parse::<Tier>(), Ok(Tier::Weekly));
        assert!("nightly".parse::<Tier>().is_err());
    }
}
