//! Redaction of vendor payloads before they leave the normalizer.

use serde_json::{Map, Value};

/// Replacement written over sensitive values.
pub const REDACTED: &str = "***REDACTED***";

/// Key substrings (lowercase) whose values are always replaced.
const SENSITIVE_KEYS: &[&str] = &["token", "secret", "password", "authorization", "cookie"];

/// Query parameters that mark a signed URL.
const SIGNATURE_PARAMS: &[&str] = &["x-amz-signature", "signature", "sig="];

/// Returns a copy of `value` with sensitive keys replaced and signed URL
/// query strings stripped.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let lower = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) => Value::String(strip_signature(s)),
        other => other.clone(),
    }
}

fn strip_signature(s: &str) -> String {
    let Some((base, query)) = s.split_once('?') else {
        return s.to_string();
    };
    let lower = query.to_lowercase();
    if SIGNATURE_PARAMS.iter().any(|p| lower.contains(p)) {
        base.to_string()
    } else {
        s.to_string()
    }
}
