//! Stable identity keys for business records.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::CoreError;

/// Lowercases, maps punctuation to spaces and collapses whitespace.
pub fn normalize_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex sha256 of `normalize(name) | normalize(address)`.
///
/// Name is the minimum identity anchor: a name that normalizes to nothing is rejected.
pub fn fingerprint(name: &str, address: Option<&str>) -> Result<String, CoreError> {
    let name = normalize_fragment(name);
    if name.is_empty() {
        return Err(CoreError::InvalidRecord("empty name".to_string()));
    }
    let address = address.map(normalize_fragment).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(address.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprints already emitted during one acquisition session.
#[derive(Debug, Default, Clone)]
pub struct SeenFingerprints {
    seen: HashSet<String>,
}

impl SeenFingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a fingerprint is offered.
    pub fn first_sighting(&mut self, fingerprint: &str) -> bool {
        if self.seen.contains(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.to_string());
        true
    }
}
