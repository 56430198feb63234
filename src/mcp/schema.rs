//! Argument checks run before a tool call leaves the process.
//!
//! Arguments go through `jsonschema` against the tool's `inputSchema`. On top
//! of that a required property explicitly set to `null` counts as missing.
//! A schema that does not compile rejects the arguments.

use serde_json::Value;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn validate(&self, arguments: &Value, schema: &Value) -> bool {
        match self.explain(arguments, schema) {
            Ok(()) => true,
            Err(reason) => {
                debug!(%reason, "Tool arguments rejected");
                false
            }
        }
    }

    /// Like [`validate`](Self::validate) but reports the first problem.
    pub fn explain(&self, arguments: &Value, schema: &Value) -> Result<(), String> {
        let validator =
            jsonschema::validator_for(schema).map_err(|err| format!("unusable schema: {err}"))?;
        check_required_not_null(arguments, schema, "$")?;
        let result = match validator.iter_errors(arguments).next() {
            None => Ok(()),
            Some(error) => Err(error.to_string()),
        };
        result
    }
}

fn check_required_not_null(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    let (Some(fields), Some(schema)) = (value.as_object(), schema.as_object()) else {
        return Ok(());
    };
    let required = schema.get("required").and_then(Value::as_array);
    for name in required.into_iter().flatten().filter_map(Value::as_str) {
        if fields.get(name).is_some_and(Value::is_null) {
            return Err(format!("{path}: missing required property {name}"));
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, property_schema) in properties {
            if let Some(field) = fields.get(name) {
                check_required_not_null(field, property_schema, &format!("{path}.{name}"))?;
            }
        }
    }
    Ok(())
}
