//! Named numeric channels scraped from captured solver console text.

use crate::domain::{HarnessError, HarnessResult};
use crate::numerics::{ComparisonFailure, NormTree};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A compiled channel: the literal label followed by a value up to the end of the line.
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    label: String,
    regex: Regex,
}

impl ChannelPattern {
    pub fn new(label: impl Into<String>) -> HarnessResult<Self> {
        let label = label.into();
        if label.is_empty() {
            return Err(HarnessError::InvalidChannelLabel);
        }
        let regex = Regex::new(&format!("{}(.+)\n", regex::escape(&label)))
            .map_err(|_| HarnessError::InvalidChannelLabel)?;
        Ok(Self { label, regex })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Every reported value in top-to-bottom order; empty when the channel never appears.
    pub fn extract(&self, text: &str) -> HarnessResult<Vec<f64>> {
        self.regex
            .captures_iter(text)
            .filter_map(|captures| captures.get(1))
            .map(|literal| {
                let trimmed = literal.as_str().trim();
                trimmed
                    .parse::<f64>()
                    .map_err(|_| HarnessError::MalformedChannelValue {
                        label: self.label.clone(),
                        literal: trimmed.to_string(),
                        line: text[..literal.start()].matches('\n').count() + 1,
                    })
            })
            .collect()
    }
}

pub fn extract(label: &str, text: &str) -> HarnessResult<Vec<f64>> {
    ChannelPattern::new(label)?.extract(text)
}

/// Channel names mapped to the console labels the solver prints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ChannelCatalog {
    labels: BTreeMap<String, String>,
}

impl ChannelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, label: impl Into<String>) -> &mut Self {
        self.labels.insert(name.into(), label.into());
        self
    }

    pub fn label(&self, name: &str) -> HarnessResult<&str> {
        self.labels
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| HarnessError::UnknownChannel {
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn extract_named(&self, name: &str, text: &str) -> HarnessResult<Vec<f64>> {
        extract(self.label(name)?, text)
    }
}

impl<N: Into<String>, L: Into<String>> FromIterator<(N, L)> for ChannelCatalog {
    fn from_iter<I: IntoIterator<Item = (N, L)>>(iter: I) -> Self {
        Self {
            labels: iter
                .into_iter()
                .map(|(name, label)| (name.into(), label.into()))
                .collect(),
        }
    }
}

/// Shape of one refinement level's error norms, naming the channel behind each entry.
///
/// Mirrors [`NormTree`]: `null` entries are skipped, strings are catalog channel names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NormLayout {
    Skip,
    Channel(String),
    Nested(Vec<NormLayout>),
}

/// Builds a level's observed norms; each referenced channel must be reported exactly once.
pub fn collect_error_norms(
    layout: &NormLayout,
    catalog: &ChannelCatalog,
    text: &str,
) -> HarnessResult<NormTree> {
    match layout {
        NormLayout::Skip => Ok(NormTree::Skip),
        NormLayout::Channel(name) => {
            let values = catalog.extract_named(name, text)?;
            match values.as_slice() {
                [value] => Ok(NormTree::Value(*value)),
                _ => Err(ComparisonFailure::Length {
                    label: name.clone(),
                    observed: values.len(),
                    expected: 1,
                }
                .into()),
            }
        }
        NormLayout::Nested(entries) => entries
            .iter()
            .map(|entry| collect_error_norms(entry, catalog, text))
            .collect::<HarnessResult<Vec<_>>>()
            .map(NormTree::Nested),
    }
}
