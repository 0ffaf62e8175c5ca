// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical JSON: the exact byte sequence that gets signed and verified.
//!
//! Object keys are sorted by their UTF-8 bytes, there is no insignificant whitespace and numbers
//! must be integers in the range which can be represented without loss in IEEE 754 doubles.
//! Strings use the minimal escaping of `serde_json`.
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Largest integer that can be represented without loss by all JSON implementations.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Top-level fields which are never covered by a signature.
const UNSIGNED_FIELDS: [&str; 2] = ["signatures", "unsigned"];

/// Serializes any value into canonical JSON.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let value = serde_json::to_value(value)?;
    canonical_json(&value)
}

/// Serializes a JSON value into canonical JSON.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalJsonError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Canonical JSON of an object with the `signatures` and `unsigned` fields removed.
pub fn canonical_json_for_signing(value: &Value) -> Result<String, CanonicalJsonError> {
    let Value::Object(object) = value else {
        return Err(CanonicalJsonError::NotAnObject);
    };
    let mut stripped = object.clone();
    for field in UNSIGNED_FIELDS {
        stripped.remove(field);
    }
    canonical_json(&Value::Object(stripped))
}

fn write_value(value: &Value, out: &mut String) -> Result<(), CanonicalJsonError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => {
            let Some(integer) = number
                .as_i64()
                .or_else(|| number.as_u64().and_then(|n| i64::try_from(n).ok()))
            else {
                return Err(CanonicalJsonError::InvalidNumber(number.to_string()));
            };
            if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&integer) {
                return Err(CanonicalJsonError::InvalidNumber(number.to_string()));
            }
            out.push_str(&integer.to_string());
        }
        Value::String(string) => out.push_str(&serde_json::to_string(string)?),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(object) => {
            let mut entries: Vec<(&String, &Value)> = object.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    #[error("only objects can be signed")]
    NotAnObject,

    #[error("number {0} can not be represented in canonical json")]
    InvalidNumber(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
