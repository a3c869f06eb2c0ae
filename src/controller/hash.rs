//! Content fingerprint used for drift detection and rollout progress keys

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hash of the propagated key/value payload
///
/// Keys are visited in lexicographic order and fed as `key \0 value \n`,
/// so the result does not depend on map iteration order. An empty payload
/// hashes to `""`.
pub fn content_hash(data: &BTreeMap<String, String>) -> String {
    if data.is_empty() {
        return String::new();
    }

    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
