use serde_json::{Map, Value};

use crate::encoding::decode_remote_string;

/// Value the remote engine sends for `undefined`.
pub const UNDEFINED_SENTINEL: &str = "___jsrdbg_undefined___";

/// Name of the placeholder child the remote engine sends instead of a large object.
pub const COLLAPSED_MARKER: &str = "___jsrdbg_collapsed___";

/// Key marking an object that describes a function.
pub const FUNCTION_DESCRIPTOR: &str = "___jsrdbg_function_desc___";

/// Position of an element inside an array value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKey {
    /// The trailing `length` pseudo-element.
    Length,
    /// A regular element.
    Index(usize),
}

/// The shape of a raw remote value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueShape<'a> {
    /// The undefined sentinel.
    Undefined,
    /// A string, number, boolean or `null`, rendered for display.
    Primitive {
        /// Display value.
        value: String,
        /// Declared type.
        type_: &'static str,
    },
    /// Anything exposing a `length` property.
    Array(Vec<(ArrayKey, &'a Value)>),
    /// Any other object; its members are fetched on demand.
    Object,
    /// An object describing a function.
    FunctionDescriptor {
        /// Parameter names joined by `, `.
        parameters: String,
    },
}

/// Classifies a raw remote value.
pub fn classify(value: &Value) -> ValueShape<'_> {
    match value {
        Value::String(text) if text == UNDEFINED_SENTINEL => ValueShape::Undefined,
        Value::String(text) => ValueShape::Primitive {
            value: decode_remote_string(text).into_owned(),
            type_: "string",
        },
        Value::Number(number) => ValueShape::Primitive {
            value: number.to_string(),
            type_: "number",
        },
        Value::Bool(flag) => ValueShape::Primitive {
            value: flag.to_string(),
            type_: "boolean",
        },
        Value::Null => ValueShape::Primitive {
            value: "null".to_owned(),
            type_: "object",
        },
        Value::Array(elements) => ValueShape::Array(
            elements
                .iter()
                .enumerate()
                .map(|(index, element)| (ArrayKey::Index(index), element))
                .collect(),
        ),
        Value::Object(members) if members.contains_key("length") => {
            ValueShape::Array(array_entries(members))
        }
        Value::Object(members) => match members.get(FUNCTION_DESCRIPTOR) {
            Some(descriptor) => ValueShape::FunctionDescriptor {
                parameters: parameter_names(descriptor),
            },
            None => ValueShape::Object,
        },
    }
}

// the index advances for every key, `length` included
fn array_entries(members: &Map<String, Value>) -> Vec<(ArrayKey, &Value)> {
    members
        .iter()
        .enumerate()
        .map(|(index, (key, element))| {
            let key = if key == "length" {
                ArrayKey::Length
            } else {
                ArrayKey::Index(index)
            };
            (key, element)
        })
        .collect()
}

fn parameter_names(descriptor: &Value) -> String {
    match descriptor.get("parameterNames") {
        Some(Value::Array(names)) => names
            .iter()
            .map(|name| match name {
                Value::String(name) => name.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(Value::String(names)) => names.split(',').map(str::trim).collect::<Vec<_>>().join(", "),
        _ => String::new(),
    }
}

/// Java-style string hash over UTF-16 code units, reinterpreted as unsigned.
pub fn name_hash(name: &str) -> u32 {
    let hash = name.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    });
    hash.cast_unsigned()
}

/// Cantor pairing of two natural numbers.
pub fn cantor_pairing(a: u64, b: u64) -> u128 {
    let (a, b) = (u128::from(a), u128::from(b));
    (a + b) * (a + b + 1) / 2 + b
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case(json!("___jsrdbg_undefined___") ; "sentinel")]
    fn undefined_sentinel(value: Value) {
        assert_eq!(classify(&value), ValueShape::Undefined);
    }

    #[test_case(json!(42), "42", "number" ; "number")]
    #[test_case(json!(1.5), "1.5", "number" ; "float")]
    #[test_case(json!(true), "true", "boolean" ; "boolean")]
    #[test_case(json!(null), "null", "object" ; "null")]
    #[test_case(json!("gr\u{c3}\u{bc}n"), "grün", "string" ; "decoded string")]
    fn primitives(value: Value, display: &str, type_: &str) {
        let ValueShape::Primitive { value, type_: actual } = classify(&value) else {
            panic!("not a primitive");
        };
        assert_eq!(value, display);
        assert_eq!(actual, type_);
    }

    #[test]
    fn objects_with_length_are_arrays() {
        let value = json!({ "0": "a", "1": "b", "length": 2 });
        let ValueShape::Array(entries) = classify(&value) else {
            panic!("not an array");
        };
        let keys: Vec<_> = entries.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, [ArrayKey::Index(0), ArrayKey::Index(1), ArrayKey::Length]);
    }

    #[test]
    fn function_descriptors() {
        let value = json!({ "___jsrdbg_function_desc___": { "parameterNames": ["a", "b"] } });
        assert_eq!(
            classify(&value),
            ValueShape::FunctionDescriptor {
                parameters: "a, b".to_owned()
            }
        );
        assert_eq!(classify(&json!({ "x": 1 })), ValueShape::Object);
    }

    #[test]
    fn hash_matches_java_string_hash() {
        assert_eq!(name_hash(""), 0);
        assert_eq!(name_hash("a"), 97);
        assert_eq!(name_hash("ab"), 97 * 31 + 98);
        // wraps like a 32-bit integer
        assert_eq!(name_hash("hello world"), 1_794_106_052);
    }

    #[test]
    fn cantor_pairing_is_injective_on_small_values() {
        assert_eq!(cantor_pairing(0, 0), 0);
        assert_eq!(cantor_pairing(1, 0), 1);
        assert_eq!(cantor_pairing(0, 1), 2);
        assert_eq!(cantor_pairing(2, 3), 18);
    }
}
