use std::{fs, path::Path};

use serde_json::Value;

use crate::{
    error::{DbError, Result},
    patch::json_equal,
};

/// A compiled document schema. Validation covers the subset of JSON Schema
/// the database relies on: type / properties / required /
/// additionalProperties / enum / minLength / maxLength / minimum / maximum /
/// items / minItems / maxItems.
#[derive(Debug, Clone)]
pub struct Schema {
    root: Value,
}

impl Schema {
    pub fn compile(root: Value) -> Result<Self> {
        if !root.is_object() {
            return Err(DbError::Config("schema root must be an object".to_string()));
        }
        if let Some(ty) = root.get("type") {
            type_names(ty)?;
        }
        Ok(Self { root })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DbError::Config(format!("cannot read schema file {}: {err}", path.display()))
        })?;
        let root: Value = serde_json::from_str(&contents)
            .map_err(|err| DbError::Config(format!("schema compilation error: {err}")))?;
        Self::compile(root)
    }

    pub fn validate(&self, instance: &Value) -> std::result::Result<(), String> {
        validate_node(&self.root, instance, "$")
    }
}

fn type_names(ty: &Value) -> Result<Vec<&str>> {
    let names: Vec<&str> = match ty {
        Value::String(name) => vec![name.as_str()],
        Value::Array(entries) => entries
            .iter()
            .map(|entry| entry.as_str())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| DbError::Config("schema type entries must be strings".to_string()))?,
        _ => {
            return Err(DbError::Config(
                "schema type must be a string or array of strings".to_string(),
            ));
        }
    };
    for name in &names {
        match *name {
            "object" | "array" | "string" | "number" | "integer" | "boolean" | "null" => {}
            other => {
                return Err(DbError::Config(format!("unknown schema type {other}")));
            }
        }
    }
    Ok(names)
}

fn kind_of(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(name: &str, instance: &Value) -> bool {
    match name {
        "integer" => instance
            .as_number()
            .map(|n| n.is_i64() || n.is_u64())
            .unwrap_or(false),
        "number" => instance.is_number(),
        other => kind_of(instance) == other,
    }
}

fn validate_node(schema: &Value, instance: &Value, at: &str) -> std::result::Result<(), String> {
    let Some(rules) = schema.as_object() else {
        return Ok(());
    };

    if let Some(ty) = rules.get("type") {
        let names = match type_names(ty) {
            Ok(names) => names,
            Err(err) => return Err(err.to_string()),
        };
        if !names.iter().any(|name| type_matches(name, instance)) {
            return Err(format!(
                "{at}: expected {}, got {}",
                names.join(" or "),
                kind_of(instance)
            ));
        }
    }

    if let Some(allowed) = rules.get("enum").and_then(Value::as_array) {
        if !allowed.iter().any(|candidate| json_equal(candidate, instance)) {
            return Err(format!("{at}: value not in enum"));
        }
    }

    if let Value::String(text) = instance {
        if let Some(min) = rules.get("minLength").and_then(Value::as_u64) {
            if (text.chars().count() as u64) < min {
                return Err(format!("{at}: string shorter than minLength {min}"));
            }
        }
        if let Some(max) = rules.get("maxLength").and_then(Value::as_u64) {
            if (text.chars().count() as u64) > max {
                return Err(format!("{at}: string longer than maxLength {max}"));
            }
        }
    }

    if let Value::Number(number) = instance {
        if let (Some(value), Some(min)) = (
            number.as_f64(),
            rules.get("minimum").and_then(Value::as_f64),
        ) {
            if value < min {
                return Err(format!("{at}: number below minimum {min}"));
            }
        }
        if let (Some(value), Some(max)) = (
            number.as_f64(),
            rules.get("maximum").and_then(Value::as_f64),
        ) {
            if value > max {
                return Err(format!("{at}: number above maximum {max}"));
            }
        }
    }

    if let Value::Object(fields) = instance {
        if let Some(required) = rules.get("required").and_then(Value::as_array) {
            for name in required {
                let Some(name) = name.as_str() else { continue };
                if !fields.contains_key(name) {
                    return Err(format!("{at}: missing required property {name}"));
                }
            }
        }

        let properties = rules.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, child_schema) in properties {
                if let Some(child) = fields.get(name) {
                    validate_node(child_schema, child, &format!("{at}.{name}"))?;
                }
            }
        }

        if rules.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in fields.keys() {
                let declared = properties.map(|p| p.contains_key(name)).unwrap_or(false);
                if !declared {
                    return Err(format!("{at}: unexpected property {name}"));
                }
            }
        }
    }

    if let Value::Array(entries) = instance {
        if let Some(min) = rules.get("minItems").and_then(Value::as_u64) {
            if (entries.len() as u64) < min {
                return Err(format!("{at}: fewer than minItems {min}"));
            }
        }
        if let Some(max) = rules.get("maxItems").and_then(Value::as_u64) {
            if (entries.len() as u64) > max {
                return Err(format!("{at}: more than maxItems {max}"));
            }
        }
        if let Some(item_schema) = rules.get("items") {
            for (index, entry) in entries.iter().enumerate() {
                validate_node(item_schema, entry, &format!("{at}[{index}]"))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn permissive_object_schema_accepts_any_object() {
        let schema = Schema::compile(json!({"type": "object"})).expect("compiles");
        schema
            .validate(&json!({"prop1": "hello", "prop2": 5, "prop3": true}))
            .expect("object accepted");
        assert!(schema.validate(&json!([1, 2])).is_err());
        assert!(schema.validate(&json!("text")).is_err());
    }

    #[test]
    fn required_and_typed_properties() {
        let schema = Schema::compile(json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string", "minLength": 1},
                "age": {"type": "integer", "minimum": 0}
            }
        }))
        .expect("compiles");

        schema
            .validate(&json!({"name": "ada", "age": 36}))
            .expect("valid instance");
        assert!(schema.validate(&json!({"age": 36})).is_err());
        assert!(schema.validate(&json!({"name": ""})).is_err());
        assert!(schema.validate(&json!({"name": "ada", "age": -1})).is_err());
        assert!(schema.validate(&json!({"name": "ada", "age": 1.5})).is_err());
    }

    #[test]
    fn additional_properties_and_items() {
        let schema = Schema::compile(json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}, "minItems": 1}
            },
            "additionalProperties": false
        }))
        .expect("compiles");

        schema
            .validate(&json!({"tags": ["a", "b"]}))
            .expect("valid instance");
        assert!(schema.validate(&json!({"tags": []})).is_err());
        assert!(schema.validate(&json!({"tags": [1]})).is_err());
        assert!(schema.validate(&json!({"other": true})).is_err());
    }

    #[test]
    fn enum_uses_numeric_equality() {
        let schema = Schema::compile(json!({"enum": [1, "two", null]})).expect("compiles");
        schema.validate(&json!(1.0)).expect("1.0 matches 1");
        schema.validate(&json!("two")).expect("string matches");
        schema.validate(&json!(null)).expect("null matches");
        assert!(schema.validate(&json!(3)).is_err());
    }

    #[test]
    fn compile_rejects_bad_roots() {
        assert!(Schema::compile(json!("string-schema")).is_err());
        assert!(Schema::compile(json!({"type": "wizard"})).is_err());
    }
}
