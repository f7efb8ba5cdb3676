//! Spec hashing for change detection.
//!
//! Property bags are hashed from their canonical JSON form. Maps are
//! ordered, so equal bags always hash equal.

use sha2::{Digest, Sha256};

use super::spec::{Properties, StackSpec};

/// Hasher for computing spec and property hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire spec.
    ///
    /// This hash changes when any resource, dependency or project setting changes.
    #[must_use]
    pub fn hash_spec(&self, spec: &StackSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(spec.project.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(spec.project.environment.as_bytes());

        for (name, resource) in &spec.resources {
            hasher.update([0u8]);
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(resource.resource_type.as_bytes());
            for dep in &resource.depends_on {
                hasher.update([1u8]);
                hasher.update(dep.as_bytes());
            }
            hasher.update(self.hash_properties(&resource.properties).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a single property bag.
    #[must_use]
    pub fn hash_properties(&self, properties: &Properties) -> String {
        let canonical = serde_json::to_vec(properties).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Computes a short hash (first 8 characters) for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(&self, a: &str, b: &str) -> bool {
        if a.len() != b.len() {
            return false;
        }
        a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}
