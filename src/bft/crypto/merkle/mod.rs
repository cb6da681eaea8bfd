//! Merkle tree batching for the signing pipeline (spec.md §6): rather
//! than signing every outgoing message individually, the replica
//! accumulates digests of messages pending signature and signs only
//! the root of a binary tree built over them once a batching timer
//! fires. Each message then carries `mt_num` (the batch size) and
//! `mt_index` (its position in the batch) plus the sibling digests
//! needed to recompute the root, instead of its own signature.

use crate::bft::crypto::hash::{Context, Digest};
use crate::bft::error::*;

/// A Merkle tree built over a batch of leaf digests.
///
/// Leaves are hashed pairwise, left to right; an odd leaf out at any
/// level is promoted unchanged to the next level, mirroring the
/// `MT_Digests_` padding scheme.
pub struct MerkleTree {
    /// `levels[0]` is the leaves; `levels.last()` is `[root]`.
    levels: Vec<Vec<Digest>>,
}

/// The inclusion path proving that `leaf` is the `index`-th of `num_leaves`
/// leaves under `root`.
#[derive(Clone, Debug)]
pub struct InclusionProof {
    index: usize,
    num_leaves: usize,
    /// Sibling digests, ordered from the leaf level up to the root.
    siblings: Vec<Digest>,
}

impl MerkleTree {
    /// Builds a tree over `leaves`. Panics if `leaves` is empty -- the
    /// signing pipeline never batches zero messages (spec.md §6).
    pub fn build(leaves: Vec<Digest>) -> Self {
        assert!(!leaves.is_empty(), "cannot build a Merkle tree over zero leaves");

        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let prev = levels.last().unwrap();
            let mut next = Vec::with_capacity((prev.len() + 1) / 2);

            let mut i = 0;
            while i < prev.len() {
                if i + 1 < prev.len() {
                    let mut ctx = Context::new();
                    ctx.update(prev[i].as_ref());
                    ctx.update(prev[i + 1].as_ref());
                    next.push(ctx.finish());
                } else {
                    next.push(prev[i]);
                }
                i += 2;
            }

            levels.push(next);
        }

        MerkleTree { levels }
    }

    /// Returns the number of leaves this tree was built over.
    pub fn num_leaves(&self) -> usize {
        self.levels[0].len()
    }

    /// Returns the root digest of this tree.
    pub fn root(&self) -> Digest {
        self.levels.last().unwrap()[0]
    }

    /// Produces the inclusion proof for the leaf at `index`.
    pub fn prove(&self, index: usize) -> Result<InclusionProof> {
        if index >= self.num_leaves() {
            return Err("leaf index out of bounds").wrapped(ErrorKind::CryptoMerkle);
        }

        let mut siblings = Vec::new();
        let mut idx = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = idx ^ 1;
            if sibling_idx < level.len() {
                siblings.push(level[sibling_idx]);
            }
            idx >>= 1;
        }

        Ok(InclusionProof { index, num_leaves: self.num_leaves(), siblings })
    }
}

impl InclusionProof {
    /// The batch size this proof was produced against (`mt_num`).
    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// This leaf's position in the batch (`mt_index`).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Recomputes the root implied by `leaf` and this proof.
    pub fn implied_root(&self, leaf: &Digest) -> Digest {
        let mut acc = *leaf;
        let mut idx = self.index;

        for sibling in &self.siblings {
            let mut ctx = Context::new();
            if idx % 2 == 0 {
                ctx.update(acc.as_ref());
                ctx.update(sibling.as_ref());
            } else {
                ctx.update(sibling.as_ref());
                ctx.update(acc.as_ref());
            }
            acc = ctx.finish();
            idx >>= 1;
        }

        acc
    }

    /// Recomputes the root implied by `leaf` and this proof, and
    /// checks it against `root`.
    pub fn verify(&self, leaf: &Digest, root: &Digest) -> bool {
        self.implied_root(leaf) == *root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(data: &[u8]) -> Digest {
        Digest::from_data(data)
    }

    #[test]
    fn test_single_leaf_tree_root_is_the_leaf() {
        let tree = MerkleTree::build(vec![leaf(b"only message")]);
        assert_eq!(tree.root().as_ref(), leaf(b"only message").as_ref());
    }

    #[test]
    fn test_proof_verifies_for_every_leaf_in_even_batch() {
        let leaves: Vec<_> = (0..4u8).map(|i| leaf(&[i])).collect();
        let tree = MerkleTree::build(leaves.clone());
        let root = tree.root();

        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.prove(i).unwrap();
            assert!(proof.verify(l, &root));
        }
    }

    #[test]
    fn test_proof_verifies_for_odd_sized_batch() {
        let leaves: Vec<_> = (0..5u8).map(|i| leaf(&[i])).collect();
        let tree = MerkleTree::build(leaves.clone());
        let root = tree.root();

        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.prove(i).unwrap();
            assert!(proof.verify(l, &root));
        }
    }

    #[test]
    fn test_proof_rejects_wrong_leaf() {
        let leaves: Vec<_> = (0..4u8).map(|i| leaf(&[i])).collect();
        let tree = MerkleTree::build(leaves);
        let root = tree.root();
        let proof = tree.prove(0).unwrap();
        assert!(!proof.verify(&leaf(b"not a real leaf"), &root));
    }
}
