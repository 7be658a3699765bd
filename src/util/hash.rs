//! Content hashing for bundles and controller-policy records.

use sha2::{Digest, Sha256};

/// Hex-encoded sha256 of a string.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hex-encoded sha256 of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hash of the policy source: empty script hashes to the empty string so the
/// reconciler can distinguish "no source" from "source present".
pub fn hash_bundle_source(
    script: &str,
    dependencies: &std::collections::BTreeMap<String, String>,
) -> Result<String, serde_json::Error> {
    if script.is_empty() {
        return Ok(String::new());
    }

    let marshalled = serde_json::to_string(&serde_json::json!({
        "script": script,
        "dependencies": dependencies,
    }))?;
    Ok(hash_string(&marshalled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_string("abc"), hash_string("abc"));
        assert_ne!(hash_string("abc"), hash_string("abd"));
        assert_eq!(hash_string("abc").len(), 64);
    }

    #[test]
    fn empty_script_hashes_to_empty() {
        let deps = BTreeMap::new();
        assert_eq!(hash_bundle_source("", &deps).unwrap(), "");
    }

    #[test]
    fn hash_changes_with_script_and_dependencies() {
        let deps = BTreeMap::new();
        let a = hash_bundle_source("allow()", &deps).unwrap();
        let b = hash_bundle_source("deny('no')", &deps).unwrap();
        assert_ne!(a, b);

        let mut deps = BTreeMap::new();
        deps.insert("helpers".to_string(), "return {}".to_string());
        let c = hash_bundle_source("allow()", &deps).unwrap();
        assert_ne!(a, c);

        // identical input hashes identically across calls
        assert_eq!(c, hash_bundle_source("allow()", &deps).unwrap());
    }
}
