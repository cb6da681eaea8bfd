//! The Global-Order (ORD) layer: a leader-driven three-phase
//! (Pre-Prepare/Prepare/Commit) protocol that totally orders the
//! Pre-Order layer's per-originator proofs, carried as a `ProofMatrix`
//! rather than a single client-batch digest.
//!
//! Kept in the teacher's shape (`TboQueue` buffering out-of-order
//! messages by how far they lead the current instance, `ProtoPhase`
//! polling, `ConsensusStatus` reporting decisions) and generalized:
//! quorum sizes are parameterized on `f, k` (`2f+k` prepare, `2f+k+1`
//! commit) instead of the teacher's hardcoded PBFT `2f`, and a single
//! instance now certifies a `ProofMatrix` digest instead of a raw
//! client-request batch digest.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::{ConsensusMessage, ConsensusMessageKind, Header};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo, View};

/// Quorum sizes for a system of `n = 3f + 2k + 1` replicas.
#[derive(Debug, Copy, Clone)]
pub struct Quorum {
    pub f: usize,
    pub k: usize,
}

impl Quorum {
    /// `2f+k` matching `Prepare`s (excluding the `Pre_Prepare`
    /// originator) form a prepare-certificate.
    pub fn prepare(&self) -> usize {
        2 * self.f + self.k
    }

    /// `2f+k+1` matching `Commit`s form a commit-certificate.
    pub fn commit(&self) -> usize {
        2 * self.f + self.k + 1
    }
}

/// Out-of-order message buffer: a deque of per-instance queues,
/// indexed relative to the current instance's sequence number. Kept
/// from the teacher's `TboQueue`, generalized to the new
/// `ConsensusMessage` shape.
pub struct TboQueue {
    curr_seq: SeqNo,
    get_queue: bool,
    pre_prepares: VecDeque<VecDeque<(Header, ConsensusMessage)>>,
    prepares: VecDeque<VecDeque<(Header, ConsensusMessage)>>,
    commits: VecDeque<VecDeque<(Header, ConsensusMessage)>>,
}

impl Orderable for TboQueue {
    fn sequence_number(&self) -> SeqNo {
        self.curr_seq
    }
}

impl TboQueue {
    fn new(curr_seq: SeqNo) -> Self {
        Self {
            curr_seq,
            get_queue: false,
            pre_prepares: VecDeque::new(),
            prepares: VecDeque::new(),
            commits: VecDeque::new(),
        }
    }

    /// Advances the instance this queue tracks, dropping any buffered
    /// messages below the new sequence number.
    pub fn advance_queue(&mut self) {
        self.curr_seq = self.curr_seq.next();
        if !self.pre_prepares.is_empty() { self.pre_prepares.pop_front(); }
        if !self.prepares.is_empty() { self.prepares.pop_front(); }
        if !self.commits.is_empty() { self.commits.pop_front(); }
    }

    fn queue_for(queue: &mut VecDeque<VecDeque<(Header, ConsensusMessage)>>, index: usize, item: (Header, ConsensusMessage)) {
        while queue.len() <= index {
            queue.push_back(VecDeque::new());
        }
        queue[index].push_back(item);
    }

    /// Buffers `message`, keyed by how many instances ahead of
    /// `curr_seq` it is. Messages behind `curr_seq` or too far ahead
    /// are rejected by the caller before reaching this method.
    pub fn queue(&mut self, header: Header, message: ConsensusMessage) {
        let seq = message.sequence_number();
        let index = match seq.index(self.curr_seq) {
            either::Either::Right(i) => i,
            either::Either::Left(_) => return,
        };
        match message.kind() {
            ConsensusMessageKind::PrePrepare(_) => Self::queue_for(&mut self.pre_prepares, index, (header, message)),
            ConsensusMessageKind::Prepare(_) => Self::queue_for(&mut self.prepares, index, (header, message)),
            ConsensusMessageKind::Commit(_) => Self::queue_for(&mut self.commits, index, (header, message)),
        }
    }

    /// Pops the next buffered message for the current instance, if
    /// any, alternating fairly between pre-prepares, prepares and
    /// commits (mirrors the teacher's round-robin `pop_message`).
    pub fn pop_message(&mut self) -> Option<(Header, ConsensusMessage)> {
        let queue = if self.get_queue { &mut self.prepares } else { &mut self.pre_prepares };
        self.get_queue = !self.get_queue;
        queue.front_mut().and_then(|q| q.pop_front())
            .or_else(|| self.commits.front_mut().and_then(|q| q.pop_front()))
    }

    pub fn signal(&mut self) {
        self.get_queue = true;
    }
}

/// The state machine driving a single consensus (ORD) instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtoPhase {
    /// Waiting for a batch to propose (leader) or a `Pre_Prepare`
    /// (follower).
    Init,
    /// The leader has broadcast a `Pre_Prepare` and is awaiting
    /// `Prepare`s.
    PrePreparing,
    /// A `Pre_Prepare` was accepted; awaiting `2f+k` `Prepare`s.
    Preparing(usize),
    /// A prepare-certificate was formed; awaiting `2f+k+1` `Commit`s.
    Committing(usize),
}

/// Reported status after processing one message.
pub enum ConsensusStatus {
    /// Two messages were received from the same replica for the same
    /// phase -- evidence of equivocation, fed to `suspect_leader`.
    VotedTwice(NodeId),
    /// The instance is still deciding.
    Deciding,
    /// A commit-certificate was formed: the proof-matrix `digest` is
    /// now ordered at this instance's sequence number.
    Decided(Digest),
}

/// One consensus (ORD) instance's accumulated votes.
pub struct Consensus {
    quorum: Quorum,
    phase: ProtoPhase,
    view: View,
    tbo: TboQueue,
    proposal_digest: Option<Digest>,
    pre_prepare_from: Option<NodeId>,
    prepares: HashMap<NodeId, Digest>,
    commits: HashMap<NodeId, Digest>,
}

impl Orderable for Consensus {
    fn sequence_number(&self) -> SeqNo {
        self.tbo.sequence_number()
    }
}

impl Deref for Consensus {
    type Target = TboQueue;
    fn deref(&self) -> &Self::Target { &self.tbo }
}

impl DerefMut for Consensus {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.tbo }
}

impl Consensus {
    pub fn new(seq: SeqNo, view: View, quorum: Quorum) -> Self {
        Self {
            quorum,
            phase: ProtoPhase::Init,
            view,
            tbo: TboQueue::new(seq),
            proposal_digest: None,
            pre_prepare_from: None,
            prepares: collections::hash_map(),
            commits: collections::hash_map(),
        }
    }

    pub fn phase(&self) -> ProtoPhase {
        self.phase
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Moves this instance on to the next sequence number, resetting
    /// per-instance vote tallies.
    pub fn next_instance(&mut self, view: View) {
        self.tbo.advance_queue();
        self.view = view;
        self.phase = ProtoPhase::Init;
        self.proposal_digest = None;
        self.pre_prepare_from = None;
        self.prepares.clear();
        self.commits.clear();
    }

    /// Leader-side: begins a new instance by broadcasting a
    /// `Pre_Prepare` over `proposal_digest` (the hash of a freshly
    /// assembled `ProofMatrix`).
    pub fn propose(&mut self, proposal_digest: Digest) -> ConsensusMessage {
        self.phase = ProtoPhase::PrePreparing;
        self.proposal_digest = Some(proposal_digest);
        ConsensusMessage::new(self.sequence_number(), self.view, ConsensusMessageKind::PrePrepare(proposal_digest))
    }

    /// Processes a message for the current instance. Out-of-order
    /// messages (wrong sequence number) should be queued via
    /// `TboQueue::queue` by the caller instead of reaching this
    /// method.
    pub fn process_message(&mut self, header: Header, message: ConsensusMessage) -> Result<ConsensusStatus> {
        match *message.kind() {
            ConsensusMessageKind::PrePrepare(digest) => self.process_pre_prepare(header, digest),
            ConsensusMessageKind::Prepare(digest) => self.process_prepare(header, digest),
            ConsensusMessageKind::Commit(digest) => self.process_commit(header, digest),
        }
    }

    fn process_pre_prepare(&mut self, header: Header, digest: Digest) -> Result<ConsensusStatus> {
        // I2 / inconsistency-attack guard: at most one Pre_Prepare is
        // accepted per (view, seq); a differing one from the same
        // leader is equivocation evidence, not a protocol error.
        if let Some(from) = self.pre_prepare_from {
            if from == header.from() {
                return Err("Duplicate Pre_Prepare from the same leader for this instance")
                    .wrapped(ErrorKind::Consensus);
            }
        }
        self.pre_prepare_from = Some(header.from());
        self.proposal_digest = Some(digest);
        self.phase = ProtoPhase::Preparing(0);
        Ok(ConsensusStatus::Deciding)
    }

    fn process_prepare(&mut self, header: Header, digest: Digest) -> Result<ConsensusStatus> {
        if matches!(self.phase, ProtoPhase::Init) {
            return Ok(ConsensusStatus::Deciding);
        }
        // exclude the Pre_Prepare originator from the prepare tally
        if Some(header.from()) == self.pre_prepare_from {
            return Ok(ConsensusStatus::Deciding);
        }
        if let Some(existing) = self.prepares.get(&header.from()) {
            if *existing != digest {
                return Ok(ConsensusStatus::VotedTwice(header.from()));
            }
            return Ok(ConsensusStatus::Deciding);
        }
        self.prepares.insert(header.from(), digest);

        let matching = self.prepares.values().filter(|d| **d == digest).count();
        if matching >= self.quorum.prepare() && self.proposal_digest == Some(digest) {
            self.phase = ProtoPhase::Committing(0);
        }
        Ok(ConsensusStatus::Deciding)
    }

    fn process_commit(&mut self, header: Header, digest: Digest) -> Result<ConsensusStatus> {
        if let Some(existing) = self.commits.get(&header.from()) {
            if *existing != digest {
                return Ok(ConsensusStatus::VotedTwice(header.from()));
            }
            return Ok(ConsensusStatus::Deciding);
        }
        self.commits.insert(header.from(), digest);

        let matching = self.commits.values().filter(|d| **d == digest).count();
        if matching >= self.quorum.commit() && self.proposal_digest == Some(digest) {
            return Ok(ConsensusStatus::Decided(digest));
        }
        Ok(ConsensusStatus::Deciding)
    }

    /// Builds this replica's own `Prepare` vote, once a `Pre_Prepare`
    /// has been accepted.
    pub fn prepare_message(&self) -> Option<ConsensusMessage> {
        self.proposal_digest.map(|d| {
            ConsensusMessage::new(self.sequence_number(), self.view, ConsensusMessageKind::Prepare(d))
        })
    }

    /// Builds this replica's own `Commit` vote, once a
    /// prepare-certificate has been formed.
    pub fn commit_message(&self) -> Option<ConsensusMessage> {
        if matches!(self.phase, ProtoPhase::Committing(_)) {
            self.proposal_digest.map(|d| {
                ConsensusMessage::new(self.sequence_number(), self.view, ConsensusMessageKind::Commit(d))
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(from: u32) -> Header {
        let (h, _) = crate::bft::communication::message::WireMessage::new(
            NodeId::from(from), NodeId::from(0), &[], None,
        ).into_inner();
        h
    }

    fn quorum() -> Quorum {
        // f=1, k=1 -> n=6, prepare quorum 3, commit quorum 4
        Quorum { f: 1, k: 1 }
    }

    #[test]
    fn test_full_three_phase_round_reaches_decided() {
        let mut c = Consensus::new(SeqNo::ZERO, View::FIRST, quorum());
        let digest = Digest::from_data(b"proof matrix bytes");
        c.process_pre_prepare(header(0), digest).unwrap();

        for r in 1..3 {
            let status = c.process_prepare(header(r), digest).unwrap();
            assert!(matches!(status, ConsensusStatus::Deciding));
        }
        assert!(matches!(c.phase(), ProtoPhase::Committing(_)));

        for r in 0..3 {
            let status = c.process_commit(header(r), digest).unwrap();
            if r < 3 - 1 {
                assert!(matches!(status, ConsensusStatus::Deciding));
            } else {
                assert!(matches!(status, ConsensusStatus::Decided(d) if d == digest));
            }
        }
    }

    #[test]
    fn test_conflicting_pre_prepare_from_same_leader_is_rejected() {
        let mut c = Consensus::new(SeqNo::ZERO, View::FIRST, quorum());
        let d1 = Digest::from_data(b"one proof matrix");
        let d2 = Digest::from_data(b"a different proof matrix");
        c.process_pre_prepare(header(0), d1).unwrap();
        assert!(c.process_pre_prepare(header(0), d2).is_err());
    }

    #[test]
    fn test_conflicting_prepares_from_same_replica_reported_as_voted_twice() {
        let mut c = Consensus::new(SeqNo::ZERO, View::FIRST, quorum());
        let d1 = Digest::from_data(b"one proof matrix");
        let d2 = Digest::from_data(b"a different proof matrix");
        c.process_pre_prepare(header(0), d1).unwrap();
        c.process_prepare(header(1), d1).unwrap();
        let status = c.process_prepare(header(1), d2).unwrap();
        assert!(matches!(status, ConsensusStatus::VotedTwice(_)));
    }
}
