//! Canonical JSON and SHA-256 digests.
//!
//! Both gateways must compute byte-identical digests for the same logical
//! message. The canonical form is compact JSON with every object's keys
//! sorted lexicographically, recursively. Arrays keep their order.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::Result;

/// Name of the envelope field that is blanked before signing.
pub const SIGNATURE_FIELD: &str = "signature";

/// Serialise `value` into its canonical byte form.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let tree = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&sort_keys(tree))?)
}

/// Canonical bytes of `value` with its top-level `signature` field set to
/// the empty string. Values that are not JSON objects are encoded as-is.
pub fn signing_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut tree = serde_json::to_value(value)?;
    if let Value::Object(map) = &mut tree {
        if map.contains_key(SIGNATURE_FIELD) {
            map.insert(SIGNATURE_FIELD.to_string(), Value::String(String::new()));
        }
    }
    Ok(serde_json::to_vec(&sort_keys(tree))?)
}

/// Lowercase hex SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of the canonical encoding of `value`.
///
/// This is the digest recorded in the session hash chain.
pub fn hash_object<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_json(value)?))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, sort_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_digest() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "s"}});
        let b = json!({"a": {"x": "s", "y": [1, 2]}, "b": 1});
        assert_eq!(hash_object(&a).unwrap(), hash_object(&b).unwrap());
    }

    #[test]
    fn array_order_changes_digest() {
        let a = json!({"v": [1, 2]});
        let b = json!({"v": [2, 1]});
        assert_ne!(hash_object(&a).unwrap(), hash_object(&b).unwrap());
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let v = json!({"z": true, "a": null});
        assert_eq!(canonical_json(&v).unwrap(), br#"{"a":null,"z":true}"#.to_vec());
    }

    #[test]
    fn signing_payload_blanks_signature() {
        let signed = json!({"body": 7, "signature": "abcd"});
        let unsigned = json!({"body": 7, "signature": ""});
        assert_eq!(
            signing_payload(&signed).unwrap(),
            canonical_json(&unsigned).unwrap()
        );
    }

    #[test]
    fn signing_payload_without_signature_field() {
        let v = json!({"body": 7});
        assert_eq!(signing_payload(&v).unwrap(), canonical_json(&v).unwrap());
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    proptest! {
        #[test]
        fn insertion_order_is_irrelevant(entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..12)) {
            let forward: Map<String, Value> = entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reverse: Map<String, Value> = entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            prop_assert_eq!(
                hash_object(&Value::Object(forward)).unwrap(),
                hash_object(&Value::Object(reverse)).unwrap()
            );
        }
    }
}
