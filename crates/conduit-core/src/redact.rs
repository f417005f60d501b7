//! Audit-payload redaction (§9 Design Notes): every event's render payload
//! is mirrored into an audit payload with secrets scrubbed and oversized
//! strings digested, before being written through the Event Log Store.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const MAX_AUDIT_STRING_LENGTH: usize = 4096;

const SENSITIVE_KEY_PARTS: &[&str] = &[
    "token",
    "api_key",
    "secret",
    "password",
    "authorization",
    "cookie",
];

fn truncate_audit_string(value: &str) -> Value {
    if value.chars().count() <= MAX_AUDIT_STRING_LENGTH {
        return Value::String(value.to_string());
    }

    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    let truncated: String = value.chars().take(MAX_AUDIT_STRING_LENGTH).collect();
    serde_json::json!({
        "value": truncated,
        "truncated": true,
        "sha256": digest,
        "original_length": value.chars().count(),
    })
}

/// Recursively redact `value` for the audit trail: sensitive keys become
/// `"[REDACTED]"`, oversized strings are digested+truncated, everything
/// else passes through unchanged. The render payload delivered to clients
/// is never touched by this function.
pub fn redact_for_audit(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, nested) in map {
                let lower = key.to_lowercase();
                if SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part)) {
                    redacted.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_for_audit(nested));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_for_audit).collect()),
        Value::String(s) => truncate_audit_string(s),
        other => other.clone(),
    }
}

/// Renders binary content placeholders used when a payload field carries
/// raw bytes rather than a JSON-native type (the JSON payload model here
/// never smuggles real bytes, but callers constructing payloads from
/// non-JSON sources should substitute this sentinel before redaction).
pub const BINARY_OMITTED: &str = "[BINARY_OMITTED]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_short_strings() {
        let v = serde_json::json!({"text": "hello"});
        assert_eq!(redact_for_audit(&v), v);
    }

    #[test]
    fn redacts_sensitive_keys_case_insensitively() {
        let v = serde_json::json!({"Authorization": "Bearer xyz", "note": "ok"});
        let redacted = redact_for_audit(&v);
        assert_eq!(redacted["Authorization"], "[REDACTED]");
        assert_eq!(redacted["note"], "ok");
    }

    #[test]
    fn truncates_and_digests_long_strings() {
        let long = "a".repeat(5000);
        let v = serde_json::json!({"body": long.clone()});
        let redacted = redact_for_audit(&v);
        let body = &redacted["body"];
        assert_eq!(body["truncated"], true);
        assert_eq!(body["original_length"], 5000);
        assert_eq!(body["value"].as_str().unwrap().len(), MAX_AUDIT_STRING_LENGTH);
        let expected_digest = hex::encode(Sha256::digest(long.as_bytes()));
        assert_eq!(body["sha256"], expected_digest);
    }
}
