//! BLAKE3 hashing of resource properties and recorded outputs.
//!
//! All hashes are rendered as `"blake3:{hex}"`. Property hashes go through a
//! canonical JSON form (object keys sorted recursively) so that the insertion
//! order of a property bag never changes its hash.

use crate::core::types::ResourceKind;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Canonical JSON text: object keys sorted at every depth, no whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash a JSON value in canonical form.
pub fn hash_json(value: &serde_json::Value) -> String {
    hash_string(&canonical_json(value))
}

/// Hash the resolved desired properties of a resource of `kind`.
///
/// The kind is part of the hash, so two resources with equal properties but
/// different kinds never compare equal.
pub fn hash_properties(kind: ResourceKind, properties: &serde_json::Value) -> String {
    composite_hash(&[kind.as_str(), &canonical_json(properties)])
}
