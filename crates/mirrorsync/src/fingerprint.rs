//! Deterministic request and content fingerprints.
//!
//! Cache keys are SHA-256 over the endpoint plus its parameters in sorted
//! order, so logically identical requests hash identically regardless of
//! the order the caller assembled the parameters in.

use sha2::{Digest, Sha256};

/// Fingerprint a request: endpoint plus sorted `key=value` parameters.
pub fn request_fingerprint(endpoint: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    for (key, value) in sorted {
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    to_hex(&hasher.finalize())
}

/// Fingerprint record content for change detection.
pub fn content_fingerprint(content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    // serde_json serializes map keys in order for sorted maps; Value's
    // default map preserves insertion order, so canonicalize first.
    update_canonical(&mut hasher, content);
    to_hex(&hasher.finalize())
}

fn update_canonical(hasher: &mut Sha256, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                update_canonical(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
        serde_json::Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                update_canonical(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        other => hasher.update(other.to_string().as_bytes()),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_order_does_not_matter() {
        let a = request_fingerprint("/items", &[("page", "2"), ("size", "100")]);
        let b = request_fingerprint("/items", &[("size", "100"), ("page", "2")]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_endpoints_differ() {
        let a = request_fingerprint("/items", &[("page", "1")]);
        let b = request_fingerprint("/assets", &[("page", "1")]);
        assert_ne!(a, b);
    }

    #[test]
    fn different_values_differ() {
        let a = request_fingerprint("/items", &[("page", "1")]);
        let b = request_fingerprint("/items", &[("page", "2")]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = request_fingerprint("/items", &[]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_fingerprint_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(content_fingerprint(&a), content_fingerprint(&b));
    }

    #[test]
    fn content_fingerprint_sees_nested_changes() {
        let a = serde_json::json!({"outer": {"inner": 1}});
        let b = serde_json::json!({"outer": {"inner": 2}});
        assert_ne!(content_fingerprint(&a), content_fingerprint(&b));
    }
}
