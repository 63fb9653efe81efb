//! Identity keys for startup tasks.
//!
//! A task's identity key is the lowercase hex SHA-256 digest of its
//! canonical JSON encoding, and doubles as the marker filename in the
//! startup state directory. The canonical encoding must stay byte-stable
//! across releases: changing it re-runs every one-shot task on upgrade.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Compute the identity key for a task descriptor.
pub fn identity_key<T: Serialize>(task: &T) -> Result<String> {
    let value = serde_json::to_value(task).context("serialize task descriptor")?;
    let digest = Sha256::digest(canonical_json(&value).as_bytes());
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    Ok(key)
}

/// Canonical JSON encoding of a task descriptor.
///
/// The descriptor mapping itself flattens into a sorted alternating
/// `[key1,value1,key2,value2,...]` list, while any *nested* mapping encodes
/// as a sorted list of `[key,value]` pairs. The asymmetry is deliberate:
/// marker filenames produced by earlier releases depend on it, so both
/// shapes are preserved exactly. No insignificant whitespace is emitted.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut items = Vec::with_capacity(keys.len() * 2);
            for key in keys {
                items.push(encode(&Value::String(key.clone())));
                items.push(encode(&map[key]));
            }
            format!("[{}]", items.join(","))
        }
        other => encode(other),
    }
}

fn encode(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .iter()
                .map(|key| {
                    format!(
                        "[{},{}]",
                        encode(&Value::String((*key).clone())),
                        encode(&map[*key])
                    )
                })
                .collect();
            format!("[{}]", pairs.join(","))
        }
        Value::Array(items) => {
            let encoded: Vec<String> = items.iter().map(encode).collect();
            format!("[{}]", encoded.join(","))
        }
        // Scalars carry no ordering concerns; compact serde encoding is
        // already canonical.
        scalar => serde_json::to_string(scalar).expect("scalar JSON serialization"),
    }
}
