//! # Schema Compilation and Validation
//!
//! Declarative per-key rules are compiled once into an immutable [`Schema`]
//! shared read-only by every validation call. A compiled schema runs three
//! checks in order:
//!
//! 1. Type check — the value's tag must match the declared kind
//! 2. Constraint check — numeric bounds, glob patterns, enumerated sets,
//!    size limits
//! 3. Dependency check — every key a value declares it depends on must be
//!    resolvable; cycles are rejected at compile time
//!
//! A rejected value is never partially applied: validation runs before any
//! store mutation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, ValidationKind};
use crate::pattern::glob_match;
use crate::types::{ConfigKey, ConfigValue, TypeTag};

/// Broad type classes a schema can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
    Str,
    Bytes,
    Array,
    Object,
    /// Any type accepted; constraints may still apply.
    Any,
}

impl ValueKind {
    fn matches(&self, value: &ConfigValue) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::Bool => matches!(value.type_tag(), TypeTag::Bool),
            ValueKind::Int => matches!(
                value.type_tag(),
                TypeTag::I8 | TypeTag::I16 | TypeTag::I32 | TypeTag::I64
            ),
            ValueKind::UInt => matches!(
                value.type_tag(),
                TypeTag::U8 | TypeTag::U16 | TypeTag::U32 | TypeTag::U64
            ),
            ValueKind::Float => matches!(value.type_tag(), TypeTag::F32 | TypeTag::F64),
            ValueKind::Str => matches!(value.type_tag(), TypeTag::Str),
            ValueKind::Bytes => matches!(value.type_tag(), TypeTag::Bytes),
            ValueKind::Array => matches!(value.type_tag(), TypeTag::Array),
            ValueKind::Object => matches!(value.type_tag(), TypeTag::Object),
        }
    }
}

/// A single constraint on a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Inclusive numeric bounds.
    Range { min: f64, max: f64 },
    /// Glob pattern a string value must match.
    Pattern(String),
    /// The value must equal one of these.
    OneOf(Vec<String>),
    /// Maximum encoded size in bytes for strings/blobs/collections.
    MaxSize(usize),
}

/// Declarative rule for one key (or key glob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySchema {
    pub path: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Keys that must exist whenever this key is set.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// How deep a tree validation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Type checks only.
    Syntax,
    /// Types plus constraints.
    Constraints,
    /// Types, constraints and cross-key dependencies.
    Full,
}

#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub key: String,
    pub kind: ValidationKind,
    pub message: String,
}

/// Outcome of validating a configuration tree.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checked: usize,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compiled, immutable schema. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Schema {
    version: u32,
    /// Exact-path rules, checked first.
    exact: HashMap<String, KeySchema>,
    /// Glob rules, checked in declaration order.
    globs: Vec<KeySchema>,
    /// Dependency-respecting evaluation order for tree validation.
    order: Vec<String>,
}

/// Serialized schema document (what lives at `schema_path`).
#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub version: u32,
    pub keys: Vec<KeySchema>,
}

impl Schema {
    /// Compile a schema document, rejecting dependency cycles.
    pub fn compile(doc: SchemaDoc) -> Result<Self> {
        let mut exact = HashMap::new();
        let mut globs = Vec::new();

        for entry in doc.keys {
            if entry.path.contains('*') || entry.path.contains('?') {
                globs.push(entry);
            } else {
                exact.insert(entry.path.clone(), entry);
            }
        }

        let order = topological_order(&exact)?;
        debug!(
            version = doc.version,
            exact = exact.len(),
            globs = globs.len(),
            "schema compiled"
        );

        Ok(Self {
            version: doc.version,
            exact,
            globs,
            order,
        })
    }

    /// Load and compile a schema document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let doc: SchemaDoc =
            serde_json::from_slice(&data).map_err(|e| Error::Configuration {
                message: format!("schema parse error: {}", e),
            })?;
        Self::compile(doc)
    }

    /// A schema that accepts everything; used when no schema file is given.
    pub fn permissive() -> Self {
        Self {
            version: 0,
            exact: HashMap::new(),
            globs: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn rule_for(&self, path: &str) -> Option<&KeySchema> {
        self.exact
            .get(path)
            .or_else(|| self.globs.iter().find(|g| glob_match(&g.path, path)))
    }

    /// Validate one value before a write. Unknown keys pass.
    pub fn validate_value(&self, key: &ConfigKey, value: &ConfigValue) -> Result<()> {
        let rule = match self.rule_for(key.path()) {
            Some(rule) => rule,
            None => return Ok(()),
        };

        if !rule.kind.matches(value) {
            return Err(Error::Validation {
                key: key.path().to_string(),
                kind: ValidationKind::TypeMismatch,
                message: format!("expected {:?}, got {:?}", rule.kind, value.type_tag()),
            });
        }

        for constraint in &rule.constraints {
            check_constraint(key.path(), constraint, value)?;
        }
        Ok(())
    }

    /// Validate an entire configuration tree.
    ///
    /// Idempotent: the report is a pure function of `(tree, level)`.
    pub fn validate_tree(
        &self,
        tree: &BTreeMap<String, ConfigValue>,
        level: ValidationLevel,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        // Evaluate schema-known keys in dependency order, then the rest.
        let mut visited = HashSet::new();
        let ordered = self
            .order
            .iter()
            .filter(|p| tree.contains_key(p.as_str()))
            .map(|p| p.as_str())
            .chain(
                tree.keys()
                    .filter(|p| !self.exact.contains_key(p.as_str()))
                    .map(|p| p.as_str()),
            );

        for path in ordered {
            if !visited.insert(path) {
                continue;
            }
            let value = &tree[path];
            report.checked += 1;

            let rule = match self.rule_for(path) {
                Some(rule) => rule,
                None => continue,
            };

            if !rule.kind.matches(value) {
                report.failures.push(ValidationFailure {
                    key: path.to_string(),
                    kind: ValidationKind::TypeMismatch,
                    message: format!("expected {:?}, got {:?}", rule.kind, value.type_tag()),
                });
                continue;
            }

            if level == ValidationLevel::Syntax {
                continue;
            }

            for constraint in &rule.constraints {
                if let Err(Error::Validation { message, .. }) =
                    check_constraint(path, constraint, value)
                {
                    report.failures.push(ValidationFailure {
                        key: path.to_string(),
                        kind: ValidationKind::ConstraintViolated,
                        message,
                    });
                }
            }

            if level == ValidationLevel::Full {
                for dep in &rule.depends_on {
                    if !tree.contains_key(dep) {
                        report.failures.push(ValidationFailure {
                            key: path.to_string(),
                            kind: ValidationKind::UnresolvedDependency,
                            message: format!("depends on missing key {}", dep),
                        });
                    }
                }
            }
        }

        report
    }
}

fn check_constraint(path: &str, constraint: &Constraint, value: &ConfigValue) -> Result<()> {
    let violation = |message: String| Error::Validation {
        key: path.to_string(),
        kind: ValidationKind::ConstraintViolated,
        message,
    };

    match constraint {
        Constraint::Range { min, max } => {
            let n = value
                .as_f64()
                .ok_or_else(|| violation("range constraint on non-numeric value".to_string()))?;
            if n < *min || n > *max {
                return Err(violation(format!("{} outside [{}, {}]", n, min, max)));
            }
        }
        Constraint::Pattern(pattern) => {
            let s = value
                .as_str()
                .ok_or_else(|| violation("pattern constraint on non-string value".to_string()))?;
            if !glob_match(pattern, s) {
                return Err(violation(format!("{:?} does not match {:?}", s, pattern)));
            }
        }
        Constraint::OneOf(allowed) => {
            let s = value
                .as_str()
                .ok_or_else(|| violation("enum constraint on non-string value".to_string()))?;
            if !allowed.iter().any(|a| a == s) {
                return Err(violation(format!("{:?} not in {:?}", s, allowed)));
            }
        }
        Constraint::MaxSize(limit) => {
            let size = crate::serialize::encode_value(value).len();
            if size > *limit {
                return Err(violation(format!("{} bytes exceeds limit {}", size, limit)));
            }
        }
    }
    Ok(())
}

/// Order exact-path rules so that dependencies come before their dependents,
/// rejecting cycles via depth-first traversal.
fn topological_order(rules: &HashMap<String, KeySchema>) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        path: &str,
        rules: &HashMap<String, KeySchema>,
        marks: &mut HashMap<String, Mark>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(path) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(Error::Validation {
                    key: path.to_string(),
                    kind: ValidationKind::UnresolvedDependency,
                    message: "dependency cycle in schema".to_string(),
                });
            }
            None => {}
        }
        marks.insert(path.to_string(), Mark::Visiting);
        if let Some(rule) = rules.get(path) {
            for dep in &rule.depends_on {
                if rules.contains_key(dep) {
                    visit(dep, rules, marks, out)?;
                }
            }
        }
        marks.insert(path.to_string(), Mark::Done);
        out.push(path.to_string());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut out = Vec::with_capacity(rules.len());
    let mut paths: Vec<&String> = rules.keys().collect();
    paths.sort();
    for path in paths {
        visit(path, rules, &mut marks, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brightness_schema() -> Schema {
        Schema::compile(SchemaDoc {
            version: 1,
            keys: vec![
                KeySchema {
                    path: "display.brightness".to_string(),
                    kind: ValueKind::UInt,
                    constraints: vec![Constraint::Range {
                        min: 0.0,
                        max: 100.0,
                    }],
                    depends_on: vec![],
                },
                KeySchema {
                    path: "theme.id".to_string(),
                    kind: ValueKind::Str,
                    constraints: vec![Constraint::OneOf(vec![
                        "dark".to_string(),
                        "light".to_string(),
                    ])],
                    depends_on: vec![],
                },
                KeySchema {
                    path: "theme.accent".to_string(),
                    kind: ValueKind::Str,
                    constraints: vec![Constraint::Pattern("#*".to_string())],
                    depends_on: vec!["theme.id".to_string()],
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn value_in_range_passes() {
        let schema = brightness_schema();
        let key = ConfigKey::new("display.brightness").unwrap();
        assert!(schema.validate_value(&key, &ConfigValue::U32(70)).is_ok());
    }

    #[test]
    fn value_out_of_range_fails() {
        let schema = brightness_schema();
        let key = ConfigKey::new("display.brightness").unwrap();
        let err = schema
            .validate_value(&key, &ConfigValue::U32(150))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                kind: ValidationKind::ConstraintViolated,
                ..
            }
        ));
    }

    #[test]
    fn type_mismatch_detected() {
        let schema = brightness_schema();
        let key = ConfigKey::new("display.brightness").unwrap();
        let err = schema
            .validate_value(&key, &ConfigValue::Str("bright".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                kind: ValidationKind::TypeMismatch,
                ..
            }
        ));
    }

    #[test]
    fn unknown_keys_pass() {
        let schema = brightness_schema();
        let key = ConfigKey::new("unheard.of").unwrap();
        assert!(schema.validate_value(&key, &ConfigValue::Bool(true)).is_ok());
    }

    #[test]
    fn tree_validation_reports_dependencies() {
        let schema = brightness_schema();
        let tree: BTreeMap<String, ConfigValue> = [(
            "theme.accent".to_string(),
            ConfigValue::Str("#ff8800".into()),
        )]
        .into_iter()
        .collect();

        // Constraints level ignores the missing dependency...
        let report = schema.validate_tree(&tree, ValidationLevel::Constraints);
        assert!(report.is_valid());

        // ...Full level catches it.
        let report = schema.validate_tree(&tree, ValidationLevel::Full);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.failures[0].kind,
            ValidationKind::UnresolvedDependency
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let schema = brightness_schema();
        let tree: BTreeMap<String, ConfigValue> = [
            ("display.brightness".to_string(), ConfigValue::U32(255)),
            ("theme.id".to_string(), ConfigValue::Str("dark".into())),
        ]
        .into_iter()
        .collect();

        let first = schema.validate_tree(&tree, ValidationLevel::Full);
        let second = schema.validate_tree(&tree, ValidationLevel::Full);
        assert_eq!(first.checked, second.checked);
        assert_eq!(first.failures.len(), second.failures.len());
    }

    #[test]
    fn dependency_cycle_rejected_at_compile() {
        let doc = SchemaDoc {
            version: 1,
            keys: vec![
                KeySchema {
                    path: "a".to_string(),
                    kind: ValueKind::Any,
                    constraints: vec![],
                    depends_on: vec!["b".to_string()],
                },
                KeySchema {
                    path: "b".to_string(),
                    kind: ValueKind::Any,
                    constraints: vec![],
                    depends_on: vec!["a".to_string()],
                },
            ],
        };
        assert!(Schema::compile(doc).is_err());
    }

    #[test]
    fn glob_rules_apply_to_subtrees() {
        let schema = Schema::compile(SchemaDoc {
            version: 1,
            keys: vec![KeySchema {
                path: "panel.*.height".to_string(),
                kind: ValueKind::UInt,
                constraints: vec![Constraint::Range { min: 16.0, max: 256.0 }],
                depends_on: vec![],
            }],
        })
        .unwrap();

        let key = ConfigKey::new("panel.top.height").unwrap();
        assert!(schema.validate_value(&key, &ConfigValue::U32(32)).is_ok());
        assert!(schema.validate_value(&key, &ConfigValue::U32(4)).is_err());
    }
}
