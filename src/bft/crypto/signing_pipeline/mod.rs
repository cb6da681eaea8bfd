//! The signing pipeline: messages awaiting an authenticating signature
//! are placed on a FIFO, and a single RSA signature is produced over
//! the Merkle root of the whole batch once either `sig_min_time`
//! elapses or the batch grows past a size threshold. A `sig_max_time`
//! timer caps the worst-case latency a message can incur waiting on a
//! batch that never fills.
//!
//! Per-message outputs carry `(mt_num, mt_index)` plus the inclusion
//! path back to the signed root, rather than an individual signature --
//! this is what lets a single RSA operation authenticate an entire
//! batch.

use std::time::{Duration, Instant};

use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::merkle::{InclusionProof, MerkleTree};
use crate::bft::crypto::signature::{KeyPair, PublicKey, Signature};

/// The signature over a single message that was part of a signed
/// batch: the batch-wide RSA signature, the batch size (`mt_num`),
/// this message's position in the batch (`mt_index`), and the
/// sibling digests needed to recompute the signed root.
#[derive(Clone)]
pub struct BatchedSignature {
    pub signature: Signature,
    pub proof: InclusionProof,
}

impl BatchedSignature {
    /// The batch size this signature was produced against (`mt_num`).
    pub fn mt_num(&self) -> usize {
        self.proof.num_leaves()
    }

    /// This message's position within its batch (`mt_index`).
    pub fn mt_index(&self) -> usize {
        self.proof.index()
    }
}

/// Verifies that `digest` was legitimately signed as part of the
/// batch `batched` claims to belong to, under `pk`.
pub fn verify_batched(pk: &PublicKey, digest: &Digest, batched: &BatchedSignature) -> bool {
    let root = batched.proof.implied_root(digest);
    pk.verify(&root, &batched.signature)
}

/// A single entry waiting on the FIFO for its batch signature.
struct PendingEntry {
    digest: Digest,
    reply: oneshot::Sender<BatchedSignature>,
}

/// The FIFO batching signer described in spec.md's Validation &
/// Signatures component.
pub struct SigningPipeline {
    sig_min_time: Duration,
    sig_max_time: Duration,
    max_batch_size: usize,
    pending: Vec<PendingEntry>,
    oldest_enqueued_at: Option<Instant>,
}

impl SigningPipeline {
    /// Creates a new, empty signing pipeline.
    ///
    /// `sig_min_time` is the minimum time the pipeline waits for a
    /// batch to grow before flushing it; `sig_max_time` is the
    /// absolute cap on how long any single message can wait.
    pub fn new(sig_min_time: Duration, sig_max_time: Duration, max_batch_size: usize) -> Self {
        Self {
            sig_min_time,
            sig_max_time,
            max_batch_size,
            pending: Vec::new(),
            oldest_enqueued_at: None,
        }
    }

    /// Enqueues `digest` for batched signing, returning a channel that
    /// resolves once the batch containing it has been signed.
    pub fn enqueue(&mut self, digest: Digest) -> oneshot::Receiver<BatchedSignature> {
        let (tx, rx) = oneshot::channel();
        if self.pending.is_empty() {
            self.oldest_enqueued_at = Some(Instant::now());
        }
        self.pending.push(PendingEntry { digest, reply: tx });
        rx
    }

    /// Returns the number of messages currently waiting on the FIFO.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no messages are waiting on the FIFO.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` if the pipeline should flush its current batch:
    /// either the batch has grown past `max_batch_size`, `sig_min_time`
    /// has elapsed since the oldest pending entry arrived, or
    /// `sig_max_time` -- the hard latency cap -- has elapsed.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        if self.pending.len() >= self.max_batch_size {
            return true;
        }
        match self.oldest_enqueued_at {
            Some(enqueued_at) => {
                now.duration_since(enqueued_at) >= self.sig_min_time
                    || now.duration_since(enqueued_at) >= self.sig_max_time
            }
            None => false,
        }
    }

    /// Flushes the current batch: signs the Merkle root over every
    /// pending digest with `key`, and delivers each message's
    /// `BatchedSignature` to its waiting receiver.
    ///
    /// No-op if the pipeline is empty.
    pub fn flush(&mut self, key: &KeyPair) {
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        self.oldest_enqueued_at = None;

        let digests: Vec<Digest> = batch.iter().map(|e| e.digest).collect();
        let tree = MerkleTree::build(digests);
        let root = tree.root();
        let signature = key.sign(&root);

        for (index, entry) in batch.into_iter().enumerate() {
            let proof = tree.prove(index).expect("index is within the batch built above");
            let batched = BatchedSignature { signature: signature.clone(), proof };
            // the receiver may have been dropped (e.g. the caller gave
            // up waiting); that's not a pipeline error.
            let _ = entry.reply.send(batched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_max_batch_size() {
        let mut pipeline = SigningPipeline::new(Duration::from_secs(60), Duration::from_secs(120), 2);
        let rx_a = pipeline.enqueue(Digest::from_data(b"a"));
        assert!(!pipeline.should_flush(Instant::now()));
        let rx_b = pipeline.enqueue(Digest::from_data(b"b"));
        assert!(pipeline.should_flush(Instant::now()));

        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        pipeline.flush(&kp);

        let batched_a = rx_a.recv().unwrap();
        let batched_b = rx_b.recv().unwrap();
        assert_eq!(batched_a.mt_num(), 2);
        assert_eq!(batched_b.mt_num(), 2);
        assert!(verify_batched(&pk, &Digest::from_data(b"a"), &batched_a));
        assert!(verify_batched(&pk, &Digest::from_data(b"b"), &batched_b));
    }

    #[test]
    fn test_sig_min_time_gates_flush_of_a_small_batch() {
        let mut pipeline = SigningPipeline::new(Duration::from_millis(10), Duration::from_secs(60), 100);
        pipeline.enqueue(Digest::from_data(b"solo message"));
        assert!(!pipeline.should_flush(Instant::now()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(pipeline.should_flush(Instant::now()));
    }

    #[test]
    fn test_verify_batched_rejects_signature_from_different_batch() {
        let mut pipeline = SigningPipeline::new(Duration::from_secs(60), Duration::from_secs(120), 1);
        let rx = pipeline.enqueue(Digest::from_data(b"only message"));
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        pipeline.flush(&kp);
        let batched = rx.recv().unwrap();
        assert!(!verify_batched(&pk, &Digest::from_data(b"a different message"), &batched));
    }
}
