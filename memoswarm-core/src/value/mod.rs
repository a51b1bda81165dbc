//! Immutable values and their canonical byte form.
//!
//! Values are JSON-shaped. Typed Rust data enters and leaves the system via
//! `serde`, and everything that gets hashed or stored goes through the
//! [`canonical`] codec, whose byte layout is fixed so that any implementation
//! derives the same addresses for the same logical value.
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub mod canonical;

pub use serde_json::Value;

/// The map type used for composite values and named arguments.
pub type Map = serde_json::Map<String, Value>;

/// Converts typed data into a [`Value`].
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::codec)
}

/// Converts a [`Value`] back into typed data.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(Error::codec)
}

/// A short, path-safe description of a value's shape.
///
/// Mixed into address derivation so that values of different shapes never
/// share a digest input stream, and embedded in storage keys so that keys
/// stay human-navigable.
pub fn descriptor_of(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "bool".into(),
        Value::Number(n) if n.is_f64() => "float".into(),
        Value::Number(_) => "int".into(),
        Value::String(s) => format!("str_len_{}", s.len()),
        Value::Array(items) => format!("list_len_{}", items.len()),
        Value::Object(map) => format!("map_len_{}", map.len()),
    }
}

/// Rewrites a name so that it is safe to embed in a descriptor.
pub(crate) fn path_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn descriptors_follow_shape() {
        assert_eq!(descriptor_of(&json!(null)), "null");
        assert_eq!(descriptor_of(&json!(true)), "bool");
        assert_eq!(descriptor_of(&json!(-3)), "int");
        assert_eq!(descriptor_of(&json!(u64::MAX)), "int");
        assert_eq!(descriptor_of(&json!(1.5)), "float");
        assert_eq!(descriptor_of(&json!("héllo")), "str_len_6");
        assert_eq!(descriptor_of(&json!([1, 2, 3, 4, 5])), "list_len_5");
        assert_eq!(descriptor_of(&json!({"a": 1})), "map_len_1");
    }

    #[test]
    fn path_safe_names() {
        assert_eq!(path_safe("Fibonacci"), "fibonacci");
        assert_eq!(path_safe("ops::add-two"), "ops__add_two");
    }
}
