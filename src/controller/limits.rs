//! Payload size guard
//!
//! ConfigMaps are capped by the API server at 1 MiB. The guard estimates
//! the encoded size as the sum of key and value lengths and flags payloads
//! near or over that cap before any write is attempted.

use std::collections::BTreeMap;

/// Maximum payload size accepted for a target (1 MiB)
pub const PAYLOAD_LIMIT_BYTES: usize = 1024 * 1024;

/// Payloads above this size carry a warning (90% of the limit)
pub const PAYLOAD_WARN_BYTES: usize = PAYLOAD_LIMIT_BYTES * 9 / 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCheck {
    pub bytes: usize,
    pub warn: bool,
    pub block: bool,
}

impl SizeCheck {
    /// Advisory text attached to outcomes when `warn` is set
    pub fn warning(&self) -> Option<String> {
        self.warn.then(|| {
            format!(
                "payload size {} bytes is above {}% of the {} byte limit",
                self.bytes,
                PAYLOAD_WARN_BYTES * 100 / PAYLOAD_LIMIT_BYTES,
                PAYLOAD_LIMIT_BYTES
            )
        })
    }

    pub fn block_message(&self) -> String {
        format!(
            "payload size {} bytes exceeds the {} byte limit",
            self.bytes, PAYLOAD_LIMIT_BYTES
        )
    }
}

pub fn check_payload_size(payload: &BTreeMap<String, String>) -> SizeCheck {
    let bytes = payload.iter().map(|(k, v)| k.len() + v.len()).sum();

    let block = bytes > PAYLOAD_LIMIT_BYTES;
    SizeCheck {
        bytes,
        warn: !block && bytes > PAYLOAD_WARN_BYTES,
        block,
    }
}
