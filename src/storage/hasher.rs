use crate::error::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// SHA256 of raw bytes, hex encoded
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Rebuild objects with sorted keys so field order never affects a checksum
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), canonical(&map[k])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Checksum of a JSON value's plaintext
pub fn checksum_value(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(&canonical(value))?;
    let hash = hash_bytes(&bytes);
    debug!("Checksummed {} bytes: {}", bytes.len(), &hash[..8]);
    Ok(hash)
}

/// Checksum of a serialized request body, normalising it when it is JSON
pub fn checksum_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => checksum_value(&value).unwrap_or_else(|_| hash_bytes(body.as_bytes())),
        Err(_) => hash_bytes(body.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_bytes() {
        assert_eq!(
            hash_bytes(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_hash_empty() {
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"id":42,"status":"done","title":"Ensaio"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"title":"Ensaio","status":"done","id":42}"#).unwrap();
        assert_eq!(checksum_value(&a).unwrap(), checksum_value(&b).unwrap());
        assert_eq!(
            checksum_body(r#"{"status":"done","id":42,"title":"Ensaio"}"#),
            checksum_value(&a).unwrap()
        );
    }

    #[test]
    fn test_checksum_detects_change() {
        let before = json!({"id": 42, "status": "open"});
        let after = json!({"id": 42, "status": "done"});
        assert_ne!(checksum_value(&before).unwrap(), checksum_value(&after).unwrap());
    }
}
