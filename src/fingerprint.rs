//! Content fingerprints used as the dedup and resume key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::TaskRecord;

/// Hex-encoded BLAKE3 digest of a task's identity fields plus a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of `task` under the configuration variant named by `suffix`.
///
/// Only `instruction` and `input` participate; passthrough fields and any
/// output already attached to the record do not.
pub fn fingerprint(task: &TaskRecord, suffix: &str) -> Fingerprint {
    fingerprint_fields(task.instruction(), task.input(), suffix)
}

pub fn fingerprint_fields(instruction: &str, input: &str, suffix: &str) -> Fingerprint {
    Fingerprint(hash_fields(&[instruction, input, suffix]))
}

pub(crate) fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
