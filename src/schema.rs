//! JSON Schema validation collaborator.
//!
//! A thin wrapper over the `jsonschema` crate (Draft-7), shared by
//! argument resolution and module-hook validation. Multiple validation
//! errors are collapsed into one structured message carrying JSON
//! pointers.

use crate::error::{Result, StencilError};

/// Validate `value` against `schema`. `subject` names what is being
/// validated in error messages (e.g. `base.arguments.name`).
///
/// # Errors
///
/// `SchemaValidation` carrying every violation, one per line, each
/// prefixed with its JSON pointer.
pub fn validate(schema: &serde_json::Value, value: &serde_json::Value, subject: &str) -> Result<()> {
    let validator = jsonschema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .build(schema)
        .map_err(|e| StencilError::SchemaValidation {
            subject: subject.to_string(),
            message: format!("invalid schema: {e}"),
        })?;

    let violations: Vec<String> = validator
        .iter_errors(value)
        .map(|error| {
            let pointer = error.instance_path().to_string();
            let pointer = if pointer.is_empty() { "/".to_string() } else { pointer };
            format!("{pointer}: {error}")
        })
        .collect();

    if violations.is_empty() {
        return Ok(());
    }

    Err(StencilError::SchemaValidation {
        subject: subject.to_string(),
        message: violations.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_value_passes() {
        let schema = json!({"type": "string"});
        assert!(validate(&schema, &json!("hello"), "m.arguments.name").is_ok());
    }

    #[test]
    fn test_violation_names_subject_and_pointer() {
        let schema = json!({
            "type": "object",
            "properties": {"replicas": {"type": "integer"}},
        });
        let err = validate(&schema, &json!({"replicas": "three"}), "m.arguments.deploy")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("m.arguments.deploy"), "{message}");
        assert!(message.contains("/replicas"), "{message}");
    }

    #[test]
    fn test_multiple_violations_collapse() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "string"},
            },
            "required": ["a", "b"],
        });
        let err = validate(&schema, &json!({"a": "x", "b": 1}), "subject").unwrap_err();
        match err {
            StencilError::SchemaValidation { message, .. } => {
                assert_eq!(message.lines().count(), 2, "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
