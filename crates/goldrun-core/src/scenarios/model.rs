use crate::domain::{HarnessError, HarnessResult, SubstitutionDirective, Tier};
use crate::numerics::NormTree;
use crate::parser::{ChannelCatalog, NormLayout};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Formatter;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioManifest {
    #[serde(default)]
    pub channels: ChannelCatalog,
    pub classes: Vec<ScenarioClass>,
}

/// Scenarios sharing one test directory.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioClass {
    pub name: String,
    /// Relative to the manifest file.
    pub directory: PathBuf,
    pub scenarios: Vec<ScenarioDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioDefinition {
    pub id: String,
    pub base_input: PathBuf,
    #[serde(default)]
    pub directives: Vec<SubstitutionDirective>,
    /// Empty means the scenario runs unchanged in every tier.
    #[serde(default)]
    pub tiers: TierTable<ScenarioVariant>,
    #[serde(default)]
    pub solver_flags: Vec<String>,
    #[serde(default)]
    pub diff_flags: Vec<String>,
    #[serde(default = "default_true")]
    pub compare_to_gold: bool,
    /// Whether an accelerator build of the solver can run this scenario.
    #[serde(default)]
    pub accelerator: bool,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub copy_input: bool,
    #[serde(default)]
    pub track_patterns: Vec<String>,
    #[serde(default)]
    pub channels: Vec<ChannelAssertion>,
    #[serde(default)]
    pub convergence: Option<ConvergenceStudy>,
}

fn default_true() -> bool {
    true
}

/// Per-tier overrides: parameter values, mesh resolution and output name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioVariant {
    #[serde(default)]
    pub directives: Vec<SubstitutionDirective>,
    /// Written into the document's output field; also names the gold artifact.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub levels: Vec<RefinementLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefinementLevel {
    #[serde(default)]
    pub directives: Vec<SubstitutionDirective>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelAssertion {
    /// Catalog channel name.
    pub channel: String,
    pub expected: Vec<f64>,
    pub rel_tol: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConvergenceStudy {
    /// Channel layout of one level, shaped like each reference level.
    pub norms: NormLayout,
    pub reference: Vec<NormTree>,
    pub rel_tol: f64,
}

/// Values keyed by tier. A tier may appear at most once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TierTable<T> {
    entries: BTreeMap<Tier, T>,
}

impl<T> Default for TierTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> TierTable<T> {
    pub fn get(&self, tier: Tier) -> Option<&T> {
        self.entries.get(&tier)
    }

    pub fn insert(&mut self, tier: Tier, value: T) -> Option<T> {
        self.entries.insert(tier, value)
    }

    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.entries.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> FromIterator<(Tier, T)> for TierTable<T> {
    fn from_iter<I: IntoIterator<Item = (Tier, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for TierTable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TierTableVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for TierTableVisitor<T> {
            type Value = TierTable<T>;

            fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map keyed by push, daily or weekly")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some(tier) = map.next_key::<Tier>()? {
                    if entries.contains_key(&tier) {
                        return Err(de::Error::custom(format!("duplicate tier '{tier}'")));
                    }
                    entries.insert(tier, map.next_value()?);
                }
                Ok(TierTable { entries })
            }
        }

        deserializer.deserialize_map(TierTableVisitor(PhantomData))
    }
}

impl ScenarioDefinition {
    /// `Ok(None)` for tier-independent scenarios.
    pub fn variant_for(&self, tier: Tier) -> HarnessResult<Option<&ScenarioVariant>> {
        if self.tiers.is_empty() {
            return Ok(None);
        }
        self.tiers
            .get(tier)
            .map(Some)
            .ok_or_else(|| HarnessError::TierUnavailable {
                scenario: self.id.clone(),
                tier: tier.to_string(),
            })
    }

    fn referenced_channels(&self) -> Vec<&str> {
        let mut names = self
            .channels
            .iter()
            .map(|assertion| assertion.channel.as_str())
            .collect::<Vec<_>>();
        if let Some(study) = &self.convergence {
            layout_channels(&study.norms, &mut names);
        }
        names
    }
}

fn layout_channels<'a>(layout: &'a NormLayout, names: &mut Vec<&'a str>) {
    match layout {
        NormLayout::Skip => {}
        NormLayout::Channel(name) => names.push(name),
        NormLayout::Nested(entries) => {
            for entry in entries {
                layout_channels(entry, names);
            }
        }
    }
}

impl ScenarioManifest {
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| HarnessError::io("failed to read scenario manifest", path, source))?;
        let manifest: Self = serde_json::from_str(&content).map_err(|source| HarnessError::Manifest {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    /// Rejects duplicate scenario ids within a class and unregistered channel names.
    pub fn validate(&self, path: &Path) -> HarnessResult<()> {
        let invalid = |message: String| HarnessError::Manifest {
            path: path.to_path_buf(),
            message,
        };

        for class in &self.classes {
            let mut seen = BTreeSet::new();
            for scenario in &class.scenarios {
                if !seen.insert(scenario.id.as_str()) {
                    return Err(invalid(format!(
                        "class '{}' defines scenario '{}' more than once",
                        class.name, scenario.id
                    )));
                }
                for name in scenario.referenced_channels() {
                    if self.channels.label(name).is_err() {
                        return Err(invalid(format!(
                            "scenario '{}/{}' references unknown channel '{name}'",
                            class.name, scenario.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ScenarioDefinition, ScenarioManifest, TierTable};
    use crate::domain::{DirectiveValue, HarnessError, Tier};
    use crate::numerics::NormTree;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
      "channels": { "inlet_velocity": "  Inlet - velocity_0 = " },
      "classes": [
        {
          "name": "hartmann",
          "directory": "hartmann",
          "scenarios": [
            {
              "id": "ha_sweep",
              "baseInput": "hartmann.xml",
              "directives": [
                { "tag": "Parameter", "attribute": "name", "key": "Kinematic viscosity", "value": 0.2 }
              ],
              "tiers": {
                "push": {
                  "directives": [{ "tag": "Parameter", "attribute": "name", "key": "Hartmann Number", "value": 10 }],
                  "output": "hartmann_10.exo"
                },
                "weekly": {
                  "output": "hartmann_40.exo",
                  "levels": [
                    { "directives": [{ "tag": "Parameter", "attribute": "name", "key": "Input Mesh File", "value": "mesh_20.g" }] },
                    { "directives": [{ "tag": "Parameter", "attribute": "name", "key": "Input Mesh File", "value": "mesh_40.g" }] }
                  ]
                }
              },
              "channels": [{ "channel": "inlet_velocity", "expected": [0.0006, 0.0006], "relTol": 1e-10 }]
            }
          ]
        }
      ]
    }"#;

    fn scenario(json: &str) -> ScenarioDefinition {
        serde_json::from_str(json).expect("scenario should parse")
    }

    #[test]
    fn manifest_parses_tier_table_and_channels() {
        let manifest: ScenarioManifest = serde_json::from_str(MANIFEST).expect("manifest should parse");
        manifest.validate(Path::new("scenarios.json")).expect("manifest should validate");
        let definition = &manifest.classes[0].scenarios[0];

        assert_eq!(
            definition.tiers.tiers().collect::<Vec<_>>(),
            vec![Tier::Push, Tier::Weekly]
        );
        assert!(definition.compare_to_gold);
        assert_eq!(definition.directives[0].value, DirectiveValue::Float(0.2));

        let push = definition
            .variant_for(Tier::Push)
            .expect("push should resolve")
            .expect("push variant should exist");
        assert_eq!(push.output.as_deref(), Some("hartmann_10.exo"));
        assert_eq!(push.directives[0].value, DirectiveValue::Integer(10));

        let weekly = definition
            .variant_for(Tier::Weekly)
            .expect("weekly should resolve")
            .expect("weekly variant should exist");
        assert_eq!(weekly.levels.len(), 2);
    }

    #[test]
    fn unregistered_tier_is_unavailable() {
        let manifest: ScenarioManifest = serde_json::from_str(MANIFEST).expect("manifest should parse");
        let error = manifest.classes[0].scenarios[0]
            .variant_for(Tier::Daily)
            .expect_err("daily is not registered");
        assert!(matches!(error, HarnessError::TierUnavailable { .. }));
    }

    #[test]
    fn scenarios_without_tiers_run_everywhere() {
        let definition = scenario(r#"{ "id": "cavity", "baseInput": "cavity.xml" }"#);
        for tier in Tier::ALL {
            assert!(definition.variant_for(tier).expect("tier should resolve").is_none());
        }
    }

    #[test]
    fn duplicate_tier_keys_are_rejected() {
        let error = serde_json::from_str::<TierTable<u32>>(r#"{ "weekly": 20, "weekly": 40 }"#)
            .expect_err("duplicate tier should fail");
        assert!(error.to_string().contains("duplicate tier 'weekly'"));
    }

    #[test]
    fn unknown_tier_keys_are_rejected() {
        assert!(serde_json::from_str::<TierTable<u32>>(r#"{ "nightly": 1 }"#).is_err());
    }

    #[test]
    fn convergence_reference_accepts_null_sentinels() {
        let definition = scenario(
            r#"{
              "id": "tgv",
              "baseInput": "tgv.xml",
              "compareToGold": false,
              "convergence": {
                "norms": [["l2_u", null]],
                "reference": [[[null, null]], [[6.19e-4, null]]],
                "relTol": 1e-10
              }
            }"#,
        );
        let study = definition.convergence.expect("study should parse");
        assert_eq!(
            study.reference[1],
            NormTree::nested([NormTree::nested([NormTree::Value(6.19e-4), NormTree::Skip])])
        );
        assert!(!definition.compare_to_gold);
    }

    #[test]
    fn validation_rejects_unknown_channels_and_duplicate_ids() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("scenarios.json");

        fs::write(&path, MANIFEST.replace("\"channel\": \"inlet_velocity\"", "\"channel\": \"outlet\""))
            .expect("manifest should be written");
        let error = ScenarioManifest::load(&path).expect_err("unknown channel should fail");
        assert!(error.to_string().contains("unknown channel 'outlet'"));

        let duplicated = r#"{
          "classes": [{
            "name": "cavity",
            "directory": ".",
            "scenarios": [
              { "id": "re_100", "baseInput": "cavity.xml" },
              { "id": "re_100", "baseInput": "cavity.xml" }
            ]
          }]
        }"#;
        fs::write(&path, duplicated).expect("manifest should be written");
        let error = ScenarioManifest::load(&path).expect_err("duplicate id should fail");
        assert_eq!(error.placeholder(), "INPUT.MANIFEST");
    }
}
