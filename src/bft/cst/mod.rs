//! Catchup & Jump (spec.md §4.7): a recovering or lagging replica asks
//! peers for the latest executed sequence number, then either
//! reconciles a small gap in its decision log (`Catchup`) or jumps
//! directly to a stable checkpoint backed by a quorum certificate
//! (`Jump`), when the gap is too large or a helper reports a
//! proposal-digest mismatch.
//!
//! Grounded on the teacher's `CollabStateTransfer`/`CstStatus`/
//! `CstProgress` state machine, generalized to the `CstMessage` wire
//! shape (routine catchup vs. jump, rather than a single `RecoveryState`
//! blob) and extended with helper rotation, per-source rate limiting,
//! and jump-mismatch evidence feeding `recovery`.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::communication::message::{CstMessage, CstMessageKind};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::{SeqNo, View};

enum ProtoPhase {
    Init,
    ReceivingLatest(usize),
    ReceivingState(usize),
}

struct ReceivedState {
    count: usize,
    payload: Vec<u8>,
}

/// Drives one replica's view of the catchup/jump protocol.
pub struct CollabStateTransfer {
    n: usize,
    f: usize,
    k: usize,

    base_timeout: Duration,
    curr_timeout: Duration,
    cst_seq: u64,

    phase: ProtoPhase,
    latest_seq: SeqNo,
    latest_seq_view: View,
    latest_seq_count: usize,

    received_states: HashMap<Digest, ReceivedState>,

    /// Round-robin helper selection, so catchup traffic isn't always
    /// aimed at the same peer.
    last_helper: Option<NodeId>,

    /// Per-source rate limiting: don't re-request state from a peer
    /// more often than `curr_timeout`.
    next_catchup_time: HashMap<NodeId, Instant>,

    /// Evidence a peer reported a proposal-digest mismatch for the
    /// seq this replica is trying to catch up on.
    jump_mismatch: HashSet<NodeId>,
}

/// Status returned from processing a CST message.
pub enum CstStatus {
    Nil,
    Running,
    RequestLatestConsensus,
    RequestState(CstMessageKind),
    SeqNo(SeqNo, View),
    State(CstMessageKind, Vec<u8>),
    /// `f+k+1` distinct peers reported a proposal-digest mismatch:
    /// this replica should ask `recovery` to consider a system reset.
    JumpMismatchThreshold,
}

impl CollabStateTransfer {
    pub fn new(n: usize, f: usize, k: usize, base_timeout: Duration) -> Self {
        Self {
            n,
            f,
            k,
            base_timeout,
            curr_timeout: base_timeout,
            cst_seq: 0,
            phase: ProtoPhase::Init,
            latest_seq: SeqNo::ZERO,
            latest_seq_view: View::FIRST,
            latest_seq_count: 0,
            received_states: collections::hash_map(),
            last_helper: None,
            next_catchup_time: collections::hash_map(),
            jump_mismatch: collections::hash_set(),
        }
    }

    fn quorum(&self) -> usize {
        self.n
    }

    fn next_seq(&mut self) -> u64 {
        let next = self.cst_seq;
        self.cst_seq += 1;
        next
    }

    /// Picks the next helper to target, rotating round-robin through
    /// every other known replica.
    pub fn next_helper(&mut self, excluding_self: NodeId) -> NodeId {
        let start = match self.last_helper {
            Some(id) => u32::from(id) + 1,
            None => 0,
        };
        let mut candidate = start % self.n as u32;
        while NodeId::from(candidate) == excluding_self {
            candidate = (candidate + 1) % self.n as u32;
        }
        let helper = NodeId::from(candidate);
        self.last_helper = Some(helper);
        helper
    }

    /// Whether this replica may send another catchup request to
    /// `target` right now, given the rate limit.
    pub fn may_catchup_from(&self, target: NodeId, now: Instant) -> bool {
        match self.next_catchup_time.get(&target) {
            Some(next) => now >= *next,
            None => true,
        }
    }

    fn mark_catchup_sent(&mut self, target: NodeId, now: Instant) {
        self.next_catchup_time.insert(target, now + self.curr_timeout);
    }

    /// Starts a round requesting the latest executed sequence number
    /// from every replica.
    pub fn request_latest_consensus(&mut self) -> (u64, Vec<NodeId>) {
        self.latest_seq = SeqNo::ZERO;
        self.latest_seq_count = 0;
        let seq = self.next_seq();
        self.phase = ProtoPhase::ReceivingLatest(0);
        (seq, NodeId::targets(0..self.n as u32).collect())
    }

    pub fn on_request_latest_consensus(&self, exec_aru: SeqNo, view: View, cst_seq: u64) -> CstMessage {
        CstMessage::ReplyLatestConsensus(cst_seq, exec_aru, view)
    }

    /// Processes a `ReplyLatestConsensus`.
    pub fn process_latest_reply(&mut self, cst_seq: u64, seq: SeqNo, view: View) -> CstStatus {
        let i = match self.phase {
            ProtoPhase::ReceivingLatest(i) => i,
            _ => return CstStatus::Running,
        };
        if cst_seq + 1 != self.cst_seq {
            return CstStatus::Running;
        }

        match seq.cmp(&self.latest_seq) {
            Ordering::Greater => {
                self.latest_seq = seq;
                self.latest_seq_view = view;
                self.latest_seq_count = 1;
            }
            Ordering::Equal => self.latest_seq_count += 1,
            Ordering::Less => (),
        }

        let i = i + 1;
        if i < self.quorum() {
            self.phase = ProtoPhase::ReceivingLatest(i);
            return CstStatus::Running;
        }

        self.phase = ProtoPhase::Init;
        if self.latest_seq_count > self.f {
            self.curr_timeout = self.base_timeout;
            CstStatus::SeqNo(self.latest_seq, self.latest_seq_view)
        } else {
            CstStatus::RequestLatestConsensus
        }
    }

    /// Starts a round requesting state of `kind` from every replica.
    pub fn request_state(&mut self, kind: CstMessageKind) -> (u64, CstMessageKind) {
        self.received_states.clear();
        let seq = self.next_seq();
        self.phase = ProtoPhase::ReceivingState(0);
        (seq, kind)
    }

    /// Processes a `ReplyState` carrying either a catchup log segment
    /// or a full jump checkpoint, keyed by its digest for matching
    /// across replies.
    pub fn process_state_reply(&mut self, cst_seq: u64, kind: CstMessageKind, payload: Vec<u8>) -> CstStatus {
        let i = match self.phase {
            ProtoPhase::ReceivingState(i) => i,
            _ => return CstStatus::Running,
        };
        if cst_seq + 1 != self.cst_seq {
            return CstStatus::Running;
        }

        let digest = Digest::from_data(&payload);
        let entry = self.received_states.entry(digest).or_insert(ReceivedState { count: 0, payload });
        entry.count += 1;

        let i = i + 1;
        if i < self.quorum() {
            self.phase = ProtoPhase::ReceivingState(i);
            return CstStatus::Running;
        }

        let winner = self.received_states.iter()
            .max_by_key(|(_, st)| st.count)
            .map(|(d, st)| (*d, st.count, st.payload.clone()));
        self.received_states.clear();
        self.phase = ProtoPhase::Init;

        match winner {
            Some((_, count, payload)) if count > self.f => {
                self.curr_timeout = self.base_timeout;
                CstStatus::State(kind, payload)
            }
            _ => CstStatus::RequestState(kind),
        }
    }

    /// Records a mismatch evidence report (a helper's `ReplyState`
    /// disagreed with this replica's locally computed proposal
    /// digest for the seq it asked about).
    pub fn on_jump_mismatch(&mut self, from: NodeId) -> CstStatus {
        self.jump_mismatch.insert(from);
        if self.jump_mismatch.len() >= self.f + self.k + 1 {
            CstStatus::JumpMismatchThreshold
        } else {
            CstStatus::Running
        }
    }

    pub fn clear_jump_mismatch(&mut self) {
        self.jump_mismatch.clear();
    }

    /// Handles a request timeout for the currently outstanding round,
    /// backing off exponentially.
    pub fn timed_out(&mut self, cst_seq: u64) -> CstStatus {
        if cst_seq + 1 != self.cst_seq {
            return CstStatus::Nil;
        }
        match self.phase {
            ProtoPhase::ReceivingLatest(_) => {
                self.curr_timeout *= 2;
                CstStatus::RequestLatestConsensus
            }
            ProtoPhase::ReceivingState(_) => {
                self.curr_timeout *= 2;
                CstStatus::RequestState(CstMessageKind::Catchup)
            }
            ProtoPhase::Init => CstStatus::Nil,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, ProtoPhase::Init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cst() -> CollabStateTransfer {
        CollabStateTransfer::new(6, 1, 1, Duration::from_millis(100)) // quorum = n = 6
    }

    #[test]
    fn test_next_helper_rotates_and_skips_self() {
        let mut c = cst();
        let me = NodeId::from(0u32);
        let h1 = c.next_helper(me);
        let h2 = c.next_helper(me);
        assert_ne!(h1, me);
        assert_ne!(h2, me);
    }

    #[test]
    fn test_latest_consensus_quorum_required() {
        let mut c = cst();
        let (seq, _) = c.request_latest_consensus();
        for _ in 0..5 {
            let status = c.process_latest_reply(seq, SeqNo::from(7u32), View::FIRST);
            assert!(matches!(status, CstStatus::Running));
        }
        let status = c.process_latest_reply(seq, SeqNo::from(7u32), View::FIRST);
        assert!(matches!(status, CstStatus::SeqNo(s, _) if s == SeqNo::from(7u32)));
    }

    #[test]
    fn test_jump_mismatch_threshold_fires_at_f_plus_k_plus_1() {
        let mut c = cst();
        for r in 0..2u32 {
            let status = c.on_jump_mismatch(NodeId::from(r));
            assert!(matches!(status, CstStatus::Running));
        }
        let status = c.on_jump_mismatch(NodeId::from(2));
        assert!(matches!(status, CstStatus::JumpMismatchThreshold));
    }
}
