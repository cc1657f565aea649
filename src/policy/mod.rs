//! Policy documents: syntactic validation, policy sources and trust documents.

mod source;
pub mod trust;

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
pub use source::{PolicySource, PolicySourceOptions, managed_policy_arn};
use thiserror::Error;
pub use trust::{TrustArchetype, TrustDocument, synthesize};

/// Version string every synthesized IAM policy document carries.
pub const POLICY_VERSION: &str = "2012-10-17";

/// A policy document that failed local validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Policy document is empty")]
    Empty,

    #[error("Policy document is not valid JSON (line {line}, column {column}): {message}")]
    InvalidJson {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Policy document must be a JSON object, found {0}")]
    NotAnObject(&'static str),

    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A syntactically valid policy document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    value: Value,
}

impl ParsedDocument {
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Compact JSON suitable for submission to the backend.
    pub fn to_json(&self) -> String {
        self.value.to_string()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Check that a document is well-formed JSON with an object at the top level.
///
/// This is strictly syntax: unknown actions or malformed ARNs are left for the
/// backend to reject.
pub fn validate(document: &str) -> Result<ParsedDocument, ValidationError> {
    if document.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    let value: Value =
        serde_json::from_str(document).map_err(|e| ValidationError::InvalidJson {
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })?;

    if !value.is_object() {
        return Err(ValidationError::NotAnObject(json_kind(&value)));
    }

    Ok(ParsedDocument { value })
}

/// Read a policy document from disk and validate it.
pub fn validate_file(path: impl AsRef<Path>) -> Result<ParsedDocument, ValidationError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ValidationError::Io {
        path: path.display().to_string(),
        source,
    })?;
    validate(&contents)
}

/// Serialize a typed policy document.
pub(crate) fn to_compact_json<T: Serialize>(document: &T) -> String {
    // Serializing plain structs of strings into a String cannot fail.
    serde_json::to_string(document).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_policy() {
        let doc = validate(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"s3:GetObject","Resource":"*"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.value()["Version"], "2012-10-17");
    }

    #[test]
    fn test_validate_does_not_check_semantics() {
        // Unknown actions are the backend's concern
        let doc = validate(r#"{"Statement":[{"Action":"nope:Nothing"}]}"#);
        assert!(doc.is_ok());
    }

    #[test]
    fn test_validate_reports_position() {
        let err = validate("{\n  \"Version\": \"2012-10-17\",\n  \"Statement\": [\n}").unwrap_err();
        match err {
            ValidationError::InvalidJson { line, .. } => assert_eq!(line, 4),
            other => panic!("expected InvalidJson, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_empty_and_non_objects() {
        assert!(matches!(validate("   "), Err(ValidationError::Empty)));
        assert!(matches!(
            validate("[1, 2]"),
            Err(ValidationError::NotAnObject("an array"))
        ));
        assert!(matches!(
            validate("\"policy\""),
            Err(ValidationError::NotAnObject("a string"))
        ));
    }

    #[test]
    fn test_validate_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"Version":"2012-10-17","Statement":[]}"#).unwrap();
        assert!(validate_file(&path).is_ok());

        let missing = validate_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, ValidationError::Io { .. }));
    }
}
