//! Derives a run-specific configuration document from a base template.
//!
//! Substitution splices new attribute values into the original text, so every
//! byte outside the targeted values (comments, whitespace, attribute order)
//! survives unchanged and repeated derivations are byte-identical.

use crate::domain::{
    DirectiveTarget, DirectiveValue, HarnessError, HarnessResult, SubstitutionDirective,
};
use roxmltree::{Document, Node, ParsingOptions};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Points the derived document at a previous run's output so the solver resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub field: DirectiveTarget,
    /// Appended to the base template's file stem to name the prior artifact.
    pub artifact_suffix: String,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            field: DirectiveTarget::parameter("Restart Data Input File"),
            artifact_suffix: "_solution.exo".to_string(),
        }
    }
}

impl RestartPolicy {
    pub fn source_name(&self, base_path: &Path) -> String {
        format!("{}{}", file_stem(base_path), self.artifact_suffix)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateRequest {
    pub base_path: PathBuf,
    pub directives: Vec<SubstitutionDirective>,
    pub output_dir: PathBuf,
    pub output_name: Option<String>,
    pub restart: Option<RestartPolicy>,
}

impl TemplateRequest {
    pub fn new(base_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            directives: Vec::new(),
            output_dir: output_dir.into(),
            output_name: None,
            restart: None,
        }
    }

    pub fn directives(mut self, directives: impl IntoIterator<Item = SubstitutionDirective>) -> Self {
        self.directives.extend(directives);
        self
    }

    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = Some(policy);
        self
    }
}

/// Writes the derived document and returns its path.
///
/// Nothing is written unless every directive resolves to exactly one node.
pub fn apply(request: &TemplateRequest) -> HarnessResult<PathBuf> {
    let source = fs::read_to_string(&request.base_path)
        .map_err(|source| HarnessError::io("failed to read template", &request.base_path, source))?;

    let mut directives = request.directives.clone();
    if let Some(policy) = &request.restart {
        let restart_source = request.output_dir.join(policy.source_name(&request.base_path));
        if !restart_source.is_file() {
            return Err(HarnessError::RestartSourceMissing {
                path: restart_source,
            });
        }
        directives.push(SubstitutionDirective::for_target(
            policy.field.clone(),
            DirectiveValue::Text(policy.source_name(&request.base_path)),
        ));
    }

    let derived = substitute(&source, &request.base_path, &directives)?;

    let name = request
        .output_name
        .clone()
        .unwrap_or_else(|| default_output_name(&request.base_path, &directives));
    let output_path = request.output_dir.join(name);
    if same_file(&output_path, &request.base_path) {
        return Err(HarnessError::DerivedPathCollision {
            path: request.base_path.clone(),
        });
    }

    fs::write(&output_path, derived)
        .map_err(|source| HarnessError::io("failed to write derived document", &output_path, source))?;
    tracing::info!(
        base = %request.base_path.display(),
        derived = %output_path.display(),
        directives = directives.len(),
        "derived configuration document"
    );
    Ok(output_path)
}

/// Applies `directives` to `source` in memory. `document` only labels errors.
pub fn substitute(
    source: &str,
    document: &Path,
    directives: &[SubstitutionDirective],
) -> HarnessResult<String> {
    let tree = parse_document(source, document)?;

    // Keyed by splice offset; a repeated directive overwrites its own edit.
    let mut edits = BTreeMap::new();
    for directive in directives {
        let node = locate(&tree, document, &directive.target)?;
        let edit = edit_for(node, directive);
        edits.insert(edit.start, edit);
    }

    let mut derived = String::with_capacity(source.len() + 64);
    let mut cursor = 0;
    for edit in edits.values() {
        derived.push_str(&source[cursor..edit.start]);
        derived.push_str(&edit.text);
        cursor = edit.end;
    }
    derived.push_str(&source[cursor..]);
    Ok(derived)
}

/// Current value of the node selected by `target`, if it carries `value_attribute`.
pub fn read_value(
    source: &str,
    document: &Path,
    target: &DirectiveTarget,
    value_attribute: &str,
) -> HarnessResult<Option<String>> {
    let tree = parse_document(source, document)?;
    match locate(&tree, document, target) {
        Ok(node) => Ok(node.attribute(value_attribute).map(str::to_owned)),
        Err(HarnessError::DirectiveNotFound { .. }) => Ok(None),
        Err(error) => Err(error),
    }
}

pub fn read_value_from_path(
    document: &Path,
    target: &DirectiveTarget,
    value_attribute: &str,
) -> HarnessResult<Option<String>> {
    let source = fs::read_to_string(document)
        .map_err(|source| HarnessError::io("failed to read document", document, source))?;
    read_value(&source, document, target, value_attribute)
}

/// `<stem>_<digest>.xml`, stable for a given template and directive list.
pub fn default_output_name(base_path: &Path, directives: &[SubstitutionDirective]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_path.to_string_lossy().as_bytes());
    for directive in directives {
        hasher.update(b"\n");
        hasher.update(directive.to_string().as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    let extension = base_path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or("xml");
    format!("{}_{}.{}", file_stem(base_path), &digest[..12], extension)
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

fn parse_document<'input>(source: &'input str, document: &Path) -> HarnessResult<Document<'input>> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Document::parse_with_options(source, options).map_err(|source| HarnessError::TemplateParse {
        path: document.to_path_buf(),
        source,
    })
}

fn locate<'a, 'input>(
    tree: &'a Document<'input>,
    document: &Path,
    target: &DirectiveTarget,
) -> HarnessResult<Node<'a, 'input>> {
    let matches = tree
        .descendants()
        .filter(|node| {
            node.is_element()
                && node.tag_name().name() == target.tag
                && node.attribute(target.attribute.as_str()) == Some(target.key.as_str())
        })
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [node] => Ok(*node),
        [] => Err(HarnessError::DirectiveNotFound {
            document: document.to_path_buf(),
            target: target.clone(),
        }),
        _ => Err(HarnessError::AmbiguousDirective {
            document: document.to_path_buf(),
            target: target.clone(),
            count: matches.len(),
        }),
    }
}

fn edit_for(node: Node<'_, '_>, directive: &SubstitutionDirective) -> Edit {
    let rendered = escape_attribute(&directive.value.render());
    let existing = node
        .attributes()
        .find(|attribute| attribute.name() == directive.value_attribute);
    if let Some(attribute) = existing {
        let range = attribute.range_value();
        return Edit {
            start: range.start,
            end: range.end,
            text: rendered,
        };
    }

    // The keying attribute is guaranteed present because `locate` matched on it.
    let anchor = node
        .attributes()
        .find(|attribute| attribute.name() == directive.target.attribute)
        .map(|attribute| attribute.range().end)
        .unwrap_or_else(|| node.range().start + 1 + node.tag_name().name().len());
    Edit {
        start: anchor,
        end: anchor,
        text: format!(" {}=\"{}\"", directive.value_attribute, rendered),
    }
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn same_file(lhs: &Path, rhs: &Path) -> bool {
    if lhs == rhs {
        return true;
    }
    match (fs::canonicalize(lhs), fs::canonicalize(rhs)) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        RestartPolicy, TemplateRequest, apply, default_output_name, read_value, substitute,
    };
    use crate::domain::{DirectiveTarget, HarnessError, SubstitutionDirective};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const CAVITY: &str = r#"<ParameterList name="cavity">
  <!-- physics -->
  <ParameterList name="Fluid Properties">
    <Parameter name="Kinematic viscosity" type="double" value="0.8"/>
    <Parameter name='Density' type="double" value='1.0'/>
  </ParameterList>
  <ParameterList name="Mesh">
    <Parameter name="X Elements" type="int" value="20"/>
    <Parameter name="Y Elements" type="int" value="20"/>
  </ParameterList>
  <Parameter name="Exodus Output File" type="string" value="cavity_solution.exo"/>
  <Parameter name="Momentum Source" type="Array(double)" value="{0.0, 0.0}"/>
</ParameterList>
"#;

    fn doc() -> &'static Path {
        Path::new("cavity.xml")
    }

    #[test]
    fn targeted_values_change_and_everything_else_is_preserved() {
        let derived = substitute(
            CAVITY,
            doc(),
            &[SubstitutionDirective::parameter("Kinematic viscosity", 0.2)],
        )
        .expect("substitution should succeed");

        assert_eq!(
            derived,
            CAVITY.replace(
                r#"name="Kinematic viscosity" type="double" value="0.8""#,
                r#"name="Kinematic viscosity" type="double" value="0.2""#
            )
        );
        let value = read_value(
            &derived,
            doc(),
            &DirectiveTarget::parameter("Kinematic viscosity"),
            "value",
        )
        .expect("derived document should parse");
        assert_eq!(value.as_deref(), Some("0.2"));
    }

    #[test]
    fn vector_and_integer_values_render_in_place() {
        let derived = substitute(
            CAVITY,
            doc(),
            &[
                SubstitutionDirective::parameter("X Elements", 64),
                SubstitutionDirective::parameter("Momentum Source", [101.010101, 0.0]),
                SubstitutionDirective::parameter("Density", 2.0),
            ],
        )
        .expect("substitution should succeed");

        assert!(derived.contains(r#"<Parameter name="X Elements" type="int" value="64"/>"#));
        assert!(derived.contains(r#"value="{101.010101, 0.0}""#));
        assert!(derived.contains(r#"<Parameter name='Density' type="double" value='2.0'/>"#));
        assert!(derived.contains(r#"<Parameter name="Y Elements" type="int" value="20"/>"#));
        assert!(derived.contains("<!-- physics -->"));
    }

    #[test]
    fn repeated_directive_is_idempotent() {
        let once = substitute(
            CAVITY,
            doc(),
            &[SubstitutionDirective::parameter("Y Elements", 40)],
        )
        .expect("substitution should succeed");
        let twice = substitute(
            CAVITY,
            doc(),
            &[
                SubstitutionDirective::parameter("Y Elements", 40),
                SubstitutionDirective::parameter("Y Elements", 40),
            ],
        )
        .expect("substitution should succeed");
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_node_names_the_triple() {
        let error = substitute(
            CAVITY,
            doc(),
            &[SubstitutionDirective::parameter("Z Elements", 4)],
        )
        .expect_err("absent node should fail");
        match error {
            HarnessError::DirectiveNotFound { target, .. } => {
                assert_eq!(target, DirectiveTarget::parameter("Z Elements"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_nodes_are_ambiguous() {
        let source = r#"<root><Parameter name="dt" value="1"/><Parameter name="dt" value="2"/></root>"#;
        let error = substitute(source, doc(), &[SubstitutionDirective::parameter("dt", 3)])
            .expect_err("duplicated node should fail");
        assert!(matches!(
            error,
            HarnessError::AmbiguousDirective { count: 2, .. }
        ));
    }

    #[test]
    fn missing_value_attribute_is_inserted_after_the_key() {
        let source = r#"<root><Parameter name="dt" type="double"/></root>"#;
        let derived = substitute(source, doc(), &[SubstitutionDirective::parameter("dt", 0.5)])
            .expect("substitution should succeed");
        assert_eq!(
            derived,
            r#"<root><Parameter name="dt" value="0.5" type="double"/></root>"#
        );
    }

    #[test]
    fn replacement_text_is_escaped() {
        let derived = substitute(
            CAVITY,
            doc(),
            &[SubstitutionDirective::parameter("Exodus Output File", "a&b\"c.exo")],
        )
        .expect("substitution should succeed");
        assert!(derived.contains(r#"value="a&amp;b&quot;c.exo""#));
        let value = read_value(
            &derived,
            doc(),
            &DirectiveTarget::parameter("Exodus Output File"),
            "value",
        )
        .expect("derived document should parse");
        assert_eq!(value.as_deref(), Some("a&b\"c.exo"));
    }

    #[test]
    fn malformed_template_is_a_parse_error() {
        let error = substitute("<root><unclosed></root>", doc(), &[])
            .expect_err("malformed document should fail");
        assert!(matches!(error, HarnessError::TemplateParse { .. }));
    }

    #[test]
    fn apply_writes_nothing_when_a_directive_fails() {
        let temp = TempDir::new().expect("tempdir should be created");
        let base = temp.path().join("cavity.xml");
        fs::write(&base, CAVITY).expect("template should be written");

        let request = TemplateRequest::new(&base, temp.path())
            .directives([
                SubstitutionDirective::parameter("X Elements", 40),
                SubstitutionDirective::parameter("Missing", 1),
            ])
            .output_name("cavity_40.xml");
        assert!(apply(&request).is_err());
        assert!(!temp.path().join("cavity_40.xml").exists());
        assert_eq!(fs::read_to_string(&base).expect("template readable"), CAVITY);
    }

    #[test]
    fn apply_is_deterministic_and_leaves_the_template_untouched() {
        let temp = TempDir::new().expect("tempdir should be created");
        let base = temp.path().join("cavity.xml");
        fs::write(&base, CAVITY).expect("template should be written");
        let directives = vec![
            SubstitutionDirective::parameter("X Elements", 40),
            SubstitutionDirective::parameter("Y Elements", 40),
        ];

        let request = TemplateRequest::new(&base, temp.path()).directives(directives.clone());
        let first = apply(&request).expect("first derivation should succeed");
        let first_bytes = fs::read(&first).expect("derived document readable");
        let second = apply(&request).expect("second derivation should succeed");
        assert_eq!(first, second);
        assert_eq!(first_bytes, fs::read(&second).expect("derived document readable"));
        assert_eq!(
            first.file_name().and_then(|name| name.to_str()),
            Some(default_output_name(&base, &directives).as_str())
        );
        assert_eq!(fs::read_to_string(&base).expect("template readable"), CAVITY);
    }

    #[test]
    fn deriving_onto_the_template_is_rejected() {
        let temp = TempDir::new().expect("tempdir should be created");
        let base = temp.path().join("cavity.xml");
        fs::write(&base, CAVITY).expect("template should be written");

        let request = TemplateRequest::new(&base, temp.path()).output_name("cavity.xml");
        let error = apply(&request).expect_err("overwrite should be rejected");
        assert!(matches!(error, HarnessError::DerivedPathCollision { .. }));
        assert_eq!(fs::read_to_string(&base).expect("template readable"), CAVITY);
    }

    #[test]
    fn restart_requires_a_prior_artifact() {
        let temp = TempDir::new().expect("tempdir should be created");
        let base = temp.path().join("cavity.xml");
        fs::write(
            &base,
            CAVITY.replacen(
                "  <Parameter name=\"Momentum Source\"",
                "  <Parameter name=\"Restart Data Input File\" type=\"string\" value=\"\"/>\n  <Parameter name=\"Momentum Source\"",
                1,
            ),
        )
        .expect("template should be written");
        let policy = RestartPolicy {
            field: DirectiveTarget::parameter("Restart Data Input File"),
            artifact_suffix: "_solution.exo".to_string(),
        };
        let request = TemplateRequest::new(&base, temp.path())
            .output_name("cavity_restart.xml")
            .restart(policy);

        let error = apply(&request).expect_err("missing restart source should fail");
        match error {
            HarnessError::RestartSourceMissing { path } => {
                assert_eq!(path, temp.path().join("cavity_solution.exo"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!temp.path().join("cavity_restart.xml").exists());

        fs::write(temp.path().join("cavity_solution.exo"), b"exodus").expect("artifact written");
        let derived = apply(&request).expect("restart derivation should succeed");
        let value = read_value(
            &fs::read_to_string(&derived).expect("derived readable"),
            &derived,
            &DirectiveTarget::parameter("Restart Data Input File"),
            "value",
        )
        .expect("derived document should parse");
        assert_eq!(value.as_deref(), Some("cavity_solution.exo"));
    }
}
