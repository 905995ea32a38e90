use crate::object::ObjectId;

/// Domain-separated BLAKE3 content hasher.
///
/// The domain tag is prepended to every hash computation, so a tree and a
/// feature with identical bytes never share an id.
#[derive(Clone, Copy, Debug)]
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for immutable trees.
    pub const TREE: Self = Self {
        domain: "arbor-tree-v1",
    };
    /// Hasher for feature payloads.
    pub const FEATURE: Self = Self {
        domain: "arbor-feature-v1",
    };

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> ObjectId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        ObjectId::from_hash(*hasher.finalize().as_bytes())
    }

    /// Verify that data produces the expected object ID.
    pub fn verify(&self, data: &[u8], expected: &ObjectId) -> bool {
        self.hash(data) == *expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_separate_hashes() {
        let data = b"same bytes";
        assert_ne!(ContentHasher::TREE.hash(data), ContentHasher::FEATURE.hash(data));
        assert_ne!(ContentHasher::TREE.hash(data), ObjectId::from_bytes(data));
    }

    #[test]
    fn verify_matches_hash() {
        let id = ContentHasher::FEATURE.hash(b"road-1");
        assert!(ContentHasher::FEATURE.verify(b"road-1", &id));
        assert!(!ContentHasher::FEATURE.verify(b"road-2", &id));
    }
}
