//! Canonical JSON: object keys sorted, no whitespace, UTF-8, and integers
//! outside the IEEE-754 safe range written as decimal strings.

use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Largest integer magnitude that survives a round trip through an f64.
pub const MAX_SAFE_INTEGER: u64 = 1 << 53;

/// Serialize `value` into its canonical byte form.
pub fn canonical<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = normalize(serde_json::to_value(value)?);
    serde_json::to_vec(&value)
}

/// Sort object keys and stringify unsafe integers, recursively.
///
/// Keys are re-inserted in sorted order rather than relying on the map type,
/// since the `preserve_order` feature of `serde_json` may be enabled by
/// another crate in the dependency graph.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, normalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Number(number) => normalize_number(number),
        other => other,
    }
}

fn normalize_number(number: Number) -> Value {
    let unsafe_integer = match (number.as_u64(), number.as_i64()) {
        (Some(n), _) => n > MAX_SAFE_INTEGER,
        (None, Some(n)) => n.unsigned_abs() > MAX_SAFE_INTEGER,
        (None, None) => false,
    };
    if unsafe_integer {
        Value::String(number.to_string())
    } else {
        Value::Number(number)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keys_are_sorted_without_whitespace() {
        let bytes = canonical(&json!({"b": 1, "a": {"z": true, "c": [3, 2]}})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":[3,2],"z":true},"b":1}"#
        );
    }

    #[test]
    fn large_integers_become_strings() {
        let value = json!({
            "safe": MAX_SAFE_INTEGER,
            "big": MAX_SAFE_INTEGER + 1,
            "negative": -(MAX_SAFE_INTEGER as i64) - 1,
        });
        let bytes = canonical(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"big":"9007199254740993","negative":"-9007199254740993","safe":9007199254740992}"#
        );
    }

    #[test]
    fn utf8_is_preserved() {
        let bytes = canonical(&json!({"name": "Zoë"})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"name":"Zoë"}"#);
    }

    #[test]
    fn struct_field_order_does_not_matter() {
        #[derive(Serialize)]
        struct Forward {
            alpha: u32,
            beta: u32,
        }
        #[derive(Serialize)]
        struct Backward {
            beta: u32,
            alpha: u32,
        }
        assert_eq!(
            canonical(&Forward { alpha: 1, beta: 2 }).unwrap(),
            canonical(&Backward { beta: 2, alpha: 1 }).unwrap()
        );
    }
}
