//! Entity-reference envelope
//!
//! A link can hold an opaque entity reference instead of structured data.
//! The reference is wrapped in a reserved single-member object at the
//! document root so readers can tell the two apart.

use serde_json::Value;

pub const ENTITY_REF_KEY: &str = "@entityRef";

/// JSON text of the envelope for `reference`.
pub fn to_json(reference: &str) -> String {
    serde_json::json!({ ENTITY_REF_KEY: reference }).to_string()
}

/// Unwrap an envelope; None when `value` is anything else.
pub fn from_value(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(ENTITY_REF_KEY)?.as_str().map(str::to_string)
}
