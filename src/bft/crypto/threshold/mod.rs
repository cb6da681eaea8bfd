//! Threshold signatures, used by the Proactive Recovery & Reset
//! protocol (spec.md §7) to produce a single, constant-size
//! `Reset_Certificate` out of `2f+k+1` partial signatures over a
//! proposed system reset, instead of carrying `2f+k+1` individual RSA
//! signatures around.
//!
//! spec.md leaves the concrete scheme abstract ("a threshold-signature
//! library"); this wraps `threshold_crypto`'s pairing-based scheme,
//! the only threshold-signature crate surfaced anywhere in the
//! example pack.

use threshold_crypto::{
    PublicKeySet, PublicKeyShare, SecretKeySet, SecretKeyShare, Signature as TcSignature,
    SignatureShare as TcSignatureShare,
};

use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;

/// Generates a fresh `(threshold, n)` key set for tests and local
/// bootstrap tooling. `threshold + 1` shares are required to combine a
/// valid signature.
pub fn generate_key_set(threshold: usize, n: usize) -> (PublicKeySet, Vec<SecretKeyShare>) {
    let mut rng = rand_core::OsRng;
    let sk_set = SecretKeySet::random(threshold, &mut rng);
    let pk_set = sk_set.public_keys();
    let shares = (0..n).map(|i| sk_set.secret_key_share(i)).collect();
    (pk_set, shares)
}

/// A partial signature produced by a single replica's secret key share.
#[derive(Clone)]
pub struct PartialSignature {
    index: usize,
    share: TcSignatureShare,
}

impl PartialSignature {
    /// The index of the secret key share that produced this partial
    /// signature, within the key set.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Signs `digest` with this replica's secret key share, at index `index`
/// within the key set.
pub fn sign_share(index: usize, share: &SecretKeyShare, digest: &Digest) -> PartialSignature {
    PartialSignature { index, share: share.sign(digest.as_ref()) }
}

/// Verifies that `partial` is a valid partial signature of `digest`
/// under the public key share at its index.
pub fn verify_share(pk_set: &PublicKeySet, digest: &Digest, partial: &PartialSignature) -> bool {
    let pk_share: PublicKeyShare = pk_set.public_key_share(partial.index);
    pk_share.verify(&partial.share, digest.as_ref())
}

/// A combined threshold signature: the `Reset_Certificate` proper.
#[derive(Clone)]
pub struct Certificate(TcSignature);

/// Combines `threshold + 1` partial signatures over the same digest
/// into a single certificate.
pub fn combine(pk_set: &PublicKeySet, partials: &[PartialSignature]) -> Result<Certificate> {
    let shares = partials.iter().map(|p| (p.index, &p.share));
    let sig = pk_set.combine_signatures(shares).wrapped(ErrorKind::CryptoThresholdBls)?;
    Ok(Certificate(sig))
}

impl Certificate {
    /// Verifies this certificate against `digest` under the key set's
    /// group public key.
    pub fn verify(&self, pk_set: &PublicKeySet, digest: &Digest) -> bool {
        pk_set.public_key().verify(&self.0, digest.as_ref())
    }

    /// Serializes this certificate to its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_certificate_combines_from_quorum_of_shares() {
        // threshold = 2, so 3 shares are needed to combine a certificate --
        // analogous to a 2f+k+1 = 3 reset-proposal quorum.
        let (pk_set, shares) = generate_key_set(2, 4);
        let digest = Digest::from_data(b"reset proposal #1");

        let partials: Vec<_> =
            shares.iter().enumerate().take(3).map(|(i, sk)| sign_share(i, sk, &digest)).collect();

        for partial in &partials {
            assert!(verify_share(&pk_set, &digest, partial));
        }

        let cert = combine(&pk_set, &partials).unwrap();
        assert!(cert.verify(&pk_set, &digest));
    }

    #[test]
    fn test_certificate_rejects_wrong_digest() {
        let (pk_set, shares) = generate_key_set(1, 3);
        let digest = Digest::from_data(b"reset proposal #1");
        let other = Digest::from_data(b"reset proposal #2");

        let partials: Vec<_> =
            shares.iter().enumerate().take(2).map(|(i, sk)| sign_share(i, sk, &digest)).collect();

        let cert = combine(&pk_set, &partials).unwrap();
        assert!(!cert.verify(&pk_set, &other));
    }
}
