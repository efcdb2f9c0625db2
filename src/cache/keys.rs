//! Cache key derivation.
//!
//! A key is the XXH3-128 digest of a namespace and the canonical JSON form of
//! the request payload, rendered as 32 lowercase hex characters. Canonical JSON
//! sorts object keys recursively, so field order never changes the key.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_128;

use crate::application::error::ComputationError;

const NAMESPACE_SEPARATOR: u8 = 0;

/// Opaque, fixed-width identifier of a memoized response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the key for `payload` within `namespace`.
///
/// Fails only when the payload cannot be represented as JSON (for example a
/// map with non-string keys).
pub fn derive_key<T>(namespace: &str, payload: &T) -> Result<CacheKey, ComputationError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(payload).map_err(|err| {
        ComputationError::key_derivation(
            format!("payload for namespace `{namespace}` is not serializable"),
            &err,
        )
    })?;
    Ok(derive_key_from_value(namespace, &value))
}

pub fn derive_key_from_value(namespace: &str, payload: &Value) -> CacheKey {
    let canonical = canonicalize(payload);
    let mut input = Vec::with_capacity(namespace.len() + 1 + canonical.len());
    input.extend_from_slice(namespace.as_bytes());
    input.push(NAMESPACE_SEPARATOR);
    input.extend_from_slice(canonical.as_bytes());
    CacheKey(format!("{:032x}", xxh3_128(&input)))
}

/// Render `value` as compact JSON with object keys in sorted order.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
