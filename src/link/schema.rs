//! Advisory schema checking
//!
//! Validation is best-effort by design: violations are collected and logged
//! after a mutation, never enforced. The checker covers the structural
//! subset of JSON Schema the runtime relies on: `type`, `properties`,
//! `required`, `items` and `enum`.

use serde_json::Value;

pub struct SchemaValidator {
    root: Value,
}

impl SchemaValidator {
    pub fn parse(json_schema: &str) -> Result<Self, serde_json::Error> {
        let root = serde_json::from_str(json_schema)?;
        Ok(Self { root })
    }

    /// Human-readable violations; empty when the document conforms.
    pub fn validate(&self, doc: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        check(&self.root, doc, "#", &mut violations);
        violations
    }
}

fn check(schema: &Value, doc: &Value, at: &str, out: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, doc) {
            out.push(format!(
                "{}: expected {}, got {}",
                at,
                expected,
                type_name(doc)
            ));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(doc) {
            out.push(format!("{}: value not in enum", at));
        }
    }

    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(Value::as_object),
        doc.as_object(),
    ) {
        for (name, sub_schema) in properties {
            if let Some(member) = object.get(name) {
                check(sub_schema, member, &format!("{}/{}", at, name), out);
            }
        }
    }

    if let (Some(required), Some(object)) = (
        schema.get("required").and_then(Value::as_array),
        doc.as_object(),
    ) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                out.push(format!("{}: missing required member {}", at, name));
            }
        }
    }

    if let (Some(items), Some(elements)) = (schema.get("items"), doc.as_array()) {
        for (i, element) in elements.iter().enumerate() {
            check(items, element, &format!("{}/{}", at, i), out);
        }
    }
}

fn type_matches(expected: &str, doc: &Value) -> bool {
    match expected {
        "object" => doc.is_object(),
        "array" => doc.is_array(),
        "string" => doc.is_string(),
        "number" => doc.is_number(),
        "integer" => doc.is_i64() || doc.is_u64(),
        "boolean" => doc.is_boolean(),
        "null" => doc.is_null(),
        // Unknown type names are not our problem; stay permissive.
        _ => true,
    }
}

fn type_name(doc: &Value) -> &'static str {
    match doc {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
