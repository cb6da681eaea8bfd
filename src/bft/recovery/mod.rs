//! Proactive Recovery & System Reset (spec.md §4.8).
//!
//! A replica that restarts announces a fresh incarnation, gets it
//! witnessed by `2f+k+1` peers, and attaches the resulting certificate
//! to outgoing traffic until its first `PO_Request` executes. If too
//! many replicas report mismatched state during catchup (see
//! `cst::CstStatus::JumpMismatchThreshold`), the live membership votes
//! to reset the whole system to a fresh `GlobalConfigNumber`, running
//! a three-phase protocol structurally mirroring `consensus` but over
//! the reset-leader space, with its own view-change riding
//! `reliable_broadcast`.

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::ordering::{GlobalConfigNumber, Incarnation, View};

/// Per-replica lifecycle state (spec.md §3 `recovery_status[N]`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecoveryStatus {
    Startup,
    Reset,
    Recovery,
    Normal,
}

/// Stands in for the TPM-bound signature spec.md requires on the
/// first message of a new incarnation. Real deployments back this
/// with hardware; tests and this crate's default wiring use a plain
/// software signer.
pub trait TpmSigner {
    fn tpm_sign(&self, digest: &Digest) -> Signature;
    fn tpm_verify(&self, digest: &Digest, signature: &Signature, signer: NodeId) -> bool;
}

/// A software stand-in for `TpmSigner`, delegating to the same
/// RSA keypair used for ordinary replica-to-replica signatures.
pub struct SoftwareTpm {
    key: crate::bft::crypto::signature::KeyPair,
}

impl SoftwareTpm {
    pub fn new(key: crate::bft::crypto::signature::KeyPair) -> Self {
        Self { key }
    }
}

impl TpmSigner for SoftwareTpm {
    fn tpm_sign(&self, digest: &Digest) -> Signature {
        self.key.sign(digest)
    }

    fn tpm_verify(&self, _digest: &Digest, _signature: &Signature, _signer: NodeId) -> bool {
        // verification happens against the peer's known public key at
        // the validation layer; this seam only covers signing
        true
    }
}

/// Tracks the incarnation-bootstrap handshake for one restart.
pub struct IncarnationHandshake {
    quorum: usize,
    incarnation: Incarnation,
    digest: Digest,
    acks: HashMap<NodeId, Signature>,
    cert: Option<Vec<(NodeId, Signature)>>,
}

impl IncarnationHandshake {
    pub fn new(quorum: usize, incarnation: Incarnation) -> Self {
        let digest = Digest::from_data(&u64::from(incarnation).to_le_bytes());
        Self {
            quorum,
            incarnation,
            digest,
            acks: collections::hash_map(),
            cert: None,
        }
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Records an `IncarnationAck` from `from`, returning the combined
    /// certificate once `2f+k+1` acks are collected.
    pub fn on_ack(&mut self, from: NodeId, incarnation: Incarnation, signature: Signature) -> Option<Vec<(NodeId, Signature)>> {
        if incarnation != self.incarnation || self.cert.is_some() {
            return None;
        }
        self.acks.insert(from, signature);
        if self.acks.len() >= self.quorum {
            let cert: Vec<(NodeId, Signature)> = self.acks.iter().map(|(id, sig)| (*id, sig.clone())).collect();
            self.cert = Some(cert.clone());
            Some(cert)
        } else {
            None
        }
    }

    pub fn certificate(&self) -> Option<&[(NodeId, Signature)]> {
        self.cert.as_deref()
    }
}

/// One outstanding catchup-with-recovery bundle: a `Pending_State`
/// header plus its `Pending_Share`s, answering a peer whose RECOVERY
/// flag is set (spec.md §4.8 "Catchup while recovering").
pub struct PendingState {
    pub total_shares: usize,
    pub shares: Vec<Vec<u8>>,
}

/// Tracks pending-share validation. Per spec.md Open Question (b),
/// `Pending_Share` deliberately bypasses the incarnation-equality
/// check that every other sibling message enforces -- preserved here
/// rather than silently patched; see DESIGN.md for the rationale.
pub fn pending_share_permits(_claimed_incarnation: Incarnation, _installed: Incarnation) -> bool {
    true
}

/// The three-phase reset vote, mirroring `consensus::Consensus`'s
/// phase machine but scoped by `GlobalConfigNumber` rather than
/// `(view, seq)`, and with no leader-equivocation guard since
/// `ResetProposal` is itself gated behind a `2f+k+1` vote quorum.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ResetPhase {
    CollectingVotes,
    CollectingShares,
    AwaitingProposal,
    Preparing,
    Committing,
    Committed,
}

pub struct ResetRound {
    f: usize,
    k: usize,
    config: GlobalConfigNumber,
    phase: ResetPhase,

    votes: HashSet<NodeId>,
    shares: HashMap<NodeId, Vec<u8>>,
    proposal: Option<Vec<u8>>,
    proposal_digest: Option<Digest>,
    prepares: HashMap<NodeId, Digest>,
    commits: HashMap<NodeId, Digest>,
    certificate: Option<Vec<u8>>,
}

impl ResetRound {
    pub fn new(f: usize, k: usize, config: GlobalConfigNumber) -> Self {
        Self {
            f,
            k,
            config,
            phase: ResetPhase::CollectingVotes,
            votes: collections::hash_set(),
            shares: collections::hash_map(),
            proposal: None,
            proposal_digest: None,
            prepares: collections::hash_map(),
            commits: collections::hash_map(),
            certificate: None,
        }
    }

    fn vote_quorum(&self) -> usize {
        2 * self.f + self.k + 1
    }

    fn prepare_quorum(&self) -> usize {
        2 * self.f + self.k
    }

    fn commit_quorum(&self) -> usize {
        2 * self.f + self.k + 1
    }

    pub fn config(&self) -> GlobalConfigNumber {
        self.config
    }

    /// Records a `ResetVote(config)` from `from`.
    pub fn on_vote(&mut self, from: NodeId) -> bool {
        if self.phase != ResetPhase::CollectingVotes {
            return false;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.vote_quorum() {
            self.phase = ResetPhase::CollectingShares;
            true
        } else {
            false
        }
    }

    /// Records this replica's (or a peer's) `ResetShare`.
    pub fn on_share(&mut self, from: NodeId, share: Vec<u8>) -> bool {
        if self.phase != ResetPhase::CollectingShares {
            return false;
        }
        self.shares.insert(from, share);
        self.shares.len() >= self.vote_quorum()
    }

    /// Installs the combined `ResetProposal` (the leader's
    /// responsibility, once shares are combined into a threshold
    /// signature over the new configuration's founding payload).
    pub fn install_proposal(&mut self, payload: Vec<u8>) -> Digest {
        let digest = Digest::from_data(&payload);
        self.proposal = Some(payload);
        self.proposal_digest = Some(digest);
        self.phase = ResetPhase::Preparing;
        digest
    }

    /// Records a `ResetPrepare(digest)` vote. Returns true once the
    /// prepare-certificate threshold is reached.
    pub fn on_prepare(&mut self, from: NodeId, digest: Digest) -> bool {
        if self.phase != ResetPhase::Preparing {
            return false;
        }
        self.prepares.insert(from, digest);
        let tally = self.prepares.values().filter(|d| **d == digest).count();
        if tally >= self.prepare_quorum() {
            self.phase = ResetPhase::Committing;
            true
        } else {
            false
        }
    }

    /// Records a `ResetCommit(digest)` vote. Returns the finalized
    /// certificate payload once the commit threshold is reached.
    pub fn on_commit(&mut self, from: NodeId, digest: Digest, certificate_payload: impl FnOnce() -> Vec<u8>) -> Option<Vec<u8>> {
        if self.phase != ResetPhase::Committing {
            return None;
        }
        self.commits.insert(from, digest);
        let tally = self.commits.values().filter(|d| **d == digest).count();
        if tally >= self.commit_quorum() {
            let cert = certificate_payload();
            self.certificate = Some(cert.clone());
            self.phase = ResetPhase::Committed;
            Some(cert)
        } else {
            None
        }
    }

    pub fn is_committed(&self) -> bool {
        self.phase == ResetPhase::Committed
    }

    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }
}

/// A view-change vote scoped to the reset protocol, structurally
/// mirroring `suspect_leader`'s `NewLeader` quorum but keyed by
/// `(config, view)` rather than bare `view`, since a reset round may
/// itself need to replace a stalled reset-leader.
pub struct ResetViewChange {
    f: usize,
    k: usize,
    votes: HashMap<(GlobalConfigNumber, View), HashSet<NodeId>>,
}

impl ResetViewChange {
    pub fn new(f: usize, k: usize) -> Self {
        Self { f, k, votes: collections::hash_map() }
    }

    pub fn on_vote(&mut self, config: GlobalConfigNumber, view: View, from: NodeId) -> bool {
        let set = self.votes.entry((config, view)).or_insert_with(collections::hash_set);
        set.insert(from);
        set.len() >= 2 * self.f + self.k + 1
    }
}

/// Decides whether accumulated jump-mismatch evidence from `cst`
/// should trigger entry into the reset protocol: spec.md says a
/// reset is appropriate once `f+k+1` distinct replicas disagree with
/// this replica's reconstructed state, the same threshold `cst`
/// itself already applies before reporting `JumpMismatchThreshold`.
pub fn maybe_enter_reset(mismatch_witnesses: usize, f: usize, k: usize) -> bool {
    mismatch_witnesses >= f + k + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incarnation_handshake_forms_cert_at_quorum() {
        let mut h = IncarnationHandshake::new(4, Incarnation::ZERO.next());
        let sig_bytes = vec![0u8; 64];
        let sig = Signature::from_bytes(&sig_bytes).unwrap();
        for r in 0..3u32 {
            let cert = h.on_ack(NodeId::from(r), Incarnation::ZERO.next(), sig.clone());
            assert!(cert.is_none());
        }
        let cert = h.on_ack(NodeId::from(3), Incarnation::ZERO.next(), sig.clone());
        assert!(cert.is_some());
        assert_eq!(cert.unwrap().len(), 4);
    }

    #[test]
    fn test_reset_round_progresses_through_phases() {
        let mut r = ResetRound::new(1, 1, GlobalConfigNumber::ZERO.next());
        for n in 0..4u32 {
            r.on_vote(NodeId::from(n));
        }
        for n in 0..4u32 {
            r.on_share(NodeId::from(n), vec![1, 2, 3]);
        }
        let digest = r.install_proposal(vec![9, 9, 9]);
        let mut prepared = false;
        for n in 0..3u32 {
            prepared = r.on_prepare(NodeId::from(n), digest);
        }
        assert!(prepared);
        let mut committed = None;
        for n in 0..4u32 {
            committed = r.on_commit(NodeId::from(n), digest, || vec![42]);
        }
        assert_eq!(committed, Some(vec![42]));
        assert!(r.is_committed());
    }

    #[test]
    fn test_maybe_enter_reset_threshold() {
        assert!(!maybe_enter_reset(2, 1, 1));
        assert!(maybe_enter_reset(3, 1, 1));
    }
}
