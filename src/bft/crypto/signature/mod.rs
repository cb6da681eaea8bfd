//! RSA signatures, used to authenticate replica-to-replica and
//! client-to-replica messages (spec.md §3, §6: "RSA on a SHA-1/SHA-256
//! digest").
//!
//! Key management (PEM persistence, the configuration-manager's key
//! distribution) is explicitly out of scope per spec.md §1/§6; this
//! module only wraps the sign/verify seam.

use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;

/// The default RSA modulus size used when generating fresh keys, e.g.
/// in tests or local bootstrap tooling. Production deployments load
/// keys from the configured key directory instead (spec.md §6).
pub const DEFAULT_KEY_BITS: usize = 2048;

/// An RSA key pair: a private signing key plus its matching public key.
pub struct KeyPair {
    sk: RsaPrivateKey,
    pk: RsaPublicKey,
}

/// An RSA public key, used to verify signatures produced by the
/// matching `KeyPair`.
#[derive(Clone)]
pub struct PublicKey {
    pk: RsaPublicKey,
}

/// A fixed-size signature produced by a `KeyPair`.
///
/// The length is not fixed for RSA (it depends on key size), so unlike
/// the teacher's ed25519-sized `Signature`, this wraps a `Vec<u8>`
/// rather than a `[u8; LENGTH]` array.
#[derive(Clone, Eq, PartialEq)]
pub struct Signature(Vec<u8>);

impl KeyPair {
    /// Generates a fresh RSA key pair.
    ///
    /// Intended for tests and local bootstrap tooling; production
    /// replicas load their key from the configured key directory via
    /// `KeyPair::from_pkcs1_pem`.
    pub fn generate() -> Result<Self> {
        let mut rng = rand_core::OsRng;
        let sk = RsaPrivateKey::new(&mut rng, DEFAULT_KEY_BITS)
            .wrapped(ErrorKind::CryptoSignatureRsa)?;
        let pk = RsaPublicKey::from(&sk);
        Ok(Self { sk, pk })
    }

    /// Loads a key pair from a PKCS#1 PEM-encoded private key, the
    /// persisted-state format described in spec.md §6.
    pub fn from_pkcs1_pem(pem: &str) -> Result<Self> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        let sk = RsaPrivateKey::from_pkcs1_pem(pem).wrapped(ErrorKind::CryptoSignatureRsa)?;
        let pk = RsaPublicKey::from(&sk);
        Ok(Self { sk, pk })
    }

    /// Returns this key pair's public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey { pk: self.pk.clone() }
    }

    /// Signs the digest `digest`, producing a `Signature`.
    pub fn sign(&self, digest: &Digest) -> Signature {
        let mut rng = rand_core::OsRng;
        let signing_key = SigningKey::<Sha256>::new(self.sk.clone());
        let signature = signing_key.sign_with_rng(&mut rng, digest.as_ref());
        Signature(signature.to_bytes().to_vec())
    }
}

impl PublicKey {
    /// Loads a public key from a PKCS#1 PEM-encoded public key.
    pub fn from_pkcs1_pem(pem: &str) -> Result<Self> {
        use rsa::pkcs1::DecodeRsaPublicKey;
        let pk = RsaPublicKey::from_pkcs1_pem(pem).wrapped(ErrorKind::CryptoSignatureRsa)?;
        Ok(Self { pk })
    }

    /// Verifies that `signature` is a valid signature of `digest` under
    /// this public key.
    pub fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        let verifying_key = VerifyingKey::<Sha256>::new(self.pk.clone());
        let rsa_sig = match RsaSignature::try_from(signature.0.as_slice()) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        verifying_key.verify(digest.as_ref(), &rsa_sig).is_ok()
    }
}

impl Signature {
    /// The minimum length, in bytes, a serialized RSA signature can
    /// have for `DEFAULT_KEY_BITS`-sized keys.
    pub const LENGTH: usize = DEFAULT_KEY_BITS / 8;

    /// Reconstructs a `Signature` from its raw byte representation.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.is_empty() {
            return Err("Signature has an invalid length").wrapped(ErrorKind::CryptoSignatureRsa);
        }
        Ok(Signature(raw_bytes.to_vec()))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_then_verify_round_trip() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let digest = Digest::from_data(b"a pre-prepare digest");
        let sig = kp.sign(&digest);
        assert!(pk.verify(&digest, &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_digest() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let digest = Digest::from_data(b"original payload");
        let sig = kp.sign(&digest);
        let other_digest = Digest::from_data(b"tampered payload");
        assert!(!pk.verify(&other_digest, &sig));
    }
}
