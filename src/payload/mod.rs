//! Adaptive API response schema validation.
//!
//! Target APIs change their response shape without notice: fields get
//! renamed, new ones appear, or a number quietly becomes a string. Any of
//! those can corrupt downstream processing long before anyone notices. The
//! validator snapshots the field structure of the first good response as a
//! baseline and diffs every later response against it, reporting missing,
//! added, and type-changed fields so drift surfaces immediately.
//!
//! Nested keys are reported as dot-separated paths (`meta.page.total`).
//! Safe for concurrent use: validation takes the shared lock, re-learning
//! takes the exclusive lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("parse payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("expected a JSON object at the top level, got {0}")]
    NotAnObject(&'static str),
}

/// Classification of one structural difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MismatchKind {
    /// Field present in the current payload but not in the baseline.
    AddedField,
    /// Field present in the baseline but absent from the current payload.
    MissingField,
    /// Field present in both with a different JSON type.
    TypeChange,
}

impl MismatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MismatchKind::AddedField => "ADDED_FIELD",
            MismatchKind::MissingField => "MISSING_FIELD",
            MismatchKind::TypeChange => "TYPE_CHANGE",
        }
    }
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structural difference between the baseline and a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub kind: MismatchKind,
    /// Dot-separated path of the affected field.
    pub field: String,
    /// JSON type recorded in the baseline; empty for added fields.
    pub baseline_type: String,
    /// JSON type in the current payload; empty for missing fields.
    pub current_type: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MismatchKind::MissingField => write!(
                f,
                "PAYLOAD MISMATCH [{}] field {:?} missing (was {})",
                self.kind, self.field, self.baseline_type
            ),
            MismatchKind::AddedField => write!(
                f,
                "PAYLOAD MISMATCH [{}] field {:?} added (type {})",
                self.kind, self.field, self.current_type
            ),
            MismatchKind::TypeChange => write!(
                f,
                "PAYLOAD MISMATCH [{}] field {:?} type changed {} -> {}",
                self.kind, self.field, self.baseline_type, self.current_type
            ),
        }
    }
}

type Schema = BTreeMap<String, &'static str>;

/// Learns the structure of an API response and detects later drift.
#[derive(Debug, Default)]
pub struct SchemaValidator {
    baseline: RwLock<Option<Schema>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `data` as a JSON object and installs its flattened field
    /// schema as the baseline, replacing any previous one.
    pub fn learn(&self, data: &[u8]) -> Result<(), ValidatorError> {
        let schema = extract_schema(data)?;
        *self.baseline.write().expect("validator lock poisoned") = Some(schema);
        Ok(())
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.read().expect("validator lock poisoned").is_some()
    }

    /// Diffs `data` against the baseline. An empty list means a perfect
    /// structural match. With no baseline established, the payload is
    /// adopted as the baseline and the list is empty by definition.
    /// Mismatches come back sorted by `(field, kind)`.
    pub fn validate(&self, data: &[u8]) -> Result<Vec<Mismatch>, ValidatorError> {
        let current = extract_schema(data)?;

        let baseline = {
            let mut guard = self.baseline.write().expect("validator lock poisoned");
            match &*guard {
                Some(baseline) => baseline.clone(),
                None => {
                    *guard = Some(current);
                    return Ok(Vec::new());
                }
            }
        };

        Ok(diff_schemas(&baseline, &current))
    }

    /// Sorted list of field paths in the baseline; empty when unlearned.
    pub fn baseline_fields(&self) -> Vec<String> {
        self.baseline
            .read()
            .expect("validator lock poisoned")
            .as_ref()
            .map(|schema| schema.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Clears the baseline so the next `learn` or `validate` starts fresh.
    pub fn reset(&self) {
        *self.baseline.write().expect("validator lock poisoned") = None;
    }
}

/// Renders mismatches one per line; empty input renders as the empty string.
pub fn format_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(Mismatch::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "bool",
        Value::Null => "null",
    }
}

fn extract_schema(data: &[u8]) -> Result<Schema, ValidatorError> {
    let raw: Value = serde_json::from_slice(data)?;
    match raw {
        Value::Object(obj) => {
            let mut schema = Schema::new();
            flatten(&obj, "", &mut schema);
            Ok(schema)
        }
        other => Err(ValidatorError::NotAnObject(type_name(&other))),
    }
}

fn flatten(obj: &serde_json::Map<String, Value>, prefix: &str, schema: &mut Schema) {
    for (key, value) in obj {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        schema.insert(path.clone(), type_name(value));
        if let Value::Object(nested) = value {
            flatten(nested, &path, schema);
        }
    }
}

fn diff_schemas(baseline: &Schema, current: &Schema) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();

    for (field, b_type) in baseline {
        match current.get(field) {
            None => mismatches.push(Mismatch {
                kind: MismatchKind::MissingField,
                field: field.clone(),
                baseline_type: b_type.to_string(),
                current_type: String::new(),
            }),
            Some(c_type) if c_type != b_type => mismatches.push(Mismatch {
                kind: MismatchKind::TypeChange,
                field: field.clone(),
                baseline_type: b_type.to_string(),
                current_type: c_type.to_string(),
            }),
            Some(_) => {}
        }
    }

    for (field, c_type) in current {
        if !baseline.contains_key(field) {
            mismatches.push(Mismatch {
                kind: MismatchKind::AddedField,
                field: field.clone(),
                baseline_type: String::new(),
                current_type: c_type.to_string(),
            });
        }
    }

    mismatches.sort_by(|a, b| {
        a.field
            .cmp(&b.field)
            .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
    });
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_payload_yields_no_mismatches() {
        let validator = SchemaValidator::new();
        let payload = br#"{"status":"ok","count":42}"#;
        validator.learn(payload).unwrap();
        assert!(validator.validate(payload).unwrap().is_empty());
    }

    #[test]
    fn first_validate_adopts_baseline() {
        let validator = SchemaValidator::new();
        assert!(!validator.has_baseline());
        let mismatches = validator.validate(br#"{"a":1}"#).unwrap();
        assert!(mismatches.is_empty());
        assert!(validator.has_baseline());
    }

    #[test]
    fn detects_drift_sorted_by_field_then_kind() {
        let validator = SchemaValidator::new();
        validator
            .learn(br#"{"status":"ok","count":42,"meta":{"page":1,"total":100}}"#)
            .unwrap();
        let mismatches = validator
            .validate(br#"{"count":"42","meta":{"page":1}}"#)
            .unwrap();

        let summary: Vec<(String, MismatchKind)> = mismatches
            .iter()
            .map(|m| (m.field.clone(), m.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("count".to_string(), MismatchKind::TypeChange),
                ("meta.total".to_string(), MismatchKind::MissingField),
                ("status".to_string(), MismatchKind::MissingField),
            ]
        );
        let type_change = &mismatches[0];
        assert_eq!(type_change.baseline_type, "number");
        assert_eq!(type_change.current_type, "string");
    }

    #[test]
    fn reports_added_fields() {
        let validator = SchemaValidator::new();
        validator.learn(br#"{"a":1}"#).unwrap();
        let mismatches = validator.validate(br#"{"a":1,"b":[1,2]}"#).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].kind, MismatchKind::AddedField);
        assert_eq!(mismatches[0].current_type, "array");
    }

    #[test]
    fn rejects_non_object_top_level() {
        let validator = SchemaValidator::new();
        let err = validator.learn(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, ValidatorError::NotAnObject("array")));
    }

    #[test]
    fn reset_clears_baseline() {
        let validator = SchemaValidator::new();
        validator.learn(br#"{"a":1}"#).unwrap();
        validator.reset();
        assert!(!validator.has_baseline());
    }

    #[test]
    fn formats_mismatches_for_operators() {
        let validator = SchemaValidator::new();
        validator.learn(br#"{"count":42}"#).unwrap();
        let mismatches = validator.validate(br#"{"count":"42"}"#).unwrap();
        let rendered = format_mismatches(&mismatches);
        assert!(rendered.contains("TYPE_CHANGE"));
        assert!(rendered.contains("number -> string"));
    }
}
