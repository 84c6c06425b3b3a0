//! Input validation against the JSON schemas published in function cards

use crate::error::{AssetError, Result};
use serde_json::Value;

/// Validate input against a JSON schema
pub fn validate_input(input: &Value, schema: &Value) -> Result<()> {
    if !input.is_object() {
        return Err(AssetError::Validation("Input must be a JSON object".to_string()));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field_name in required {
            let field = field_name
                .as_str()
                .ok_or_else(|| AssetError::Validation("Invalid schema: required field not a string".to_string()))?;

            if input.get(field).map_or(true, Value::is_null) {
                return Err(AssetError::Validation(format!("Missing required field: {}", field)));
            }
        }
    }

    if let (Some(properties), Some(fields)) = (
        schema.get("properties").and_then(|p| p.as_object()),
        input.as_object(),
    ) {
        for (key, value) in fields {
            if let Some(prop_schema) = properties.get(key) {
                validate_value(key, value, prop_schema)?;
            }
        }
    }

    Ok(())
}

fn validate_value(key: &str, value: &Value, schema: &Value) -> Result<()> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        let valid = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            "null" => value.is_null(),
            _ => true,
        };
        if !valid {
            return Err(AssetError::Validation(format!(
                "Field '{}': expected {}, got {}",
                key, expected, value
            )));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(AssetError::Validation(format!("Field '{}': {} is below minimum {}", key, n, min)));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(AssetError::Validation(format!("Field '{}': {} is above maximum {}", key, n, max)));
            }
        }
    }

    if let Some(items) = schema.get("items") {
        if let Some(values) = value.as_array() {
            for item in values {
                validate_value(key, item, items)?;
            }
        }
    }

    Ok(())
}
