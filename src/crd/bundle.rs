//! LuaPolicyBundle Custom Resource Definition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// LuaPolicyBundle holds the compiled, gzip-compressed script payload for a
/// LuaPolicy. The bundle is named after its owning policy and recreated
/// whenever the source hash changes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.luapolicy.dev",
    version = "v1beta1",
    kind = "LuaPolicyBundle",
    plural = "luapolicybundles"
)]
#[serde(rename_all = "camelCase")]
pub struct LuaPolicyBundleSpec {
    /// Gzip-compressed script payload, base64 encoded on the wire.
    #[serde(with = "bundle_bytes")]
    #[schemars(with = "String")]
    pub bundle: Vec<u8>,
}

/// Kubernetes serializes `[]byte` as base64 strings; mirror that here so the
/// stored object is interoperable with other clients.
mod bundle_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_round_trips_as_base64() {
        let spec = LuaPolicyBundleSpec {
            bundle: vec![0x1f, 0x8b, 0x08, 0x00],
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["bundle"], "H4sIAA==");

        let back: LuaPolicyBundleSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back.bundle, spec.bundle);
    }
}
