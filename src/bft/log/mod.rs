//! The message log: request storage plus the ORD-layer decision log
//! and periodic application-state checkpoints.
//!
//! PO slots live in `preorder::PoTable`, not here, matching invariant
//! I1's arena-by-handle model: this module only owns ORD-layer
//! (`Pre_Prepare`/`Prepare`/`Commit`, plus view-change-installed
//! `OrdSlot`s) and client-request storage.

use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::message::{
    ConsensusMessage, ConsensusMessageKind, Header, RequestMessage, SystemMessage,
};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::executable::UpdateBatch;
use crate::bft::ordering::{Orderable, SeqNo, View};

/// Every `CATCHUP_HISTORY` decided sequence numbers, the decision log
/// is cleared and a fresh local checkpoint initiated, bounding how far
/// back a lagging replica must replay before falling back to a
/// checkpoint-backed `cst::CstMessageKind::Jump`.
pub const CATCHUP_HISTORY: u32 = 1000;

/// Information reported after a logging operation.
pub enum Info {
    /// Nothing to report.
    Nil,
    /// The log became full; waiting on the execution layer to hand
    /// back the current application state before the checkpoint can
    /// complete.
    BeginCheckpoint,
}

enum CheckpointState<S> {
    None,
    Partial { seq: SeqNo },
    PartialWithEarlier { seq: SeqNo, earlier: Checkpoint<S> },
    Complete(Checkpoint<S>),
}

/// A local checkpoint: the last application state, and the sequence
/// number of the last batch of requests executed before it.
#[derive(Clone)]
pub struct Checkpoint<S> {
    seq: SeqNo,
    appstate: S,
}

impl<S> Orderable for Checkpoint<S> {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl<S> Checkpoint<S> {
    pub fn state(&self) -> &S {
        &self.appstate
    }

    pub fn into_inner(self) -> (SeqNo, S) {
        (self.seq, self.appstate)
    }
}

/// A system message alongside the header it arrived under.
#[derive(Clone)]
pub struct StoredMessage<M> {
    header: Header,
    message: M,
}

impl<M> StoredMessage<M> {
    pub fn new(header: Header, message: M) -> Self {
        Self { header, message }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_inner(self) -> (Header, M) {
        (self.header, self.message)
    }
}

/// What a given ORD slot resolved to, once decided or replayed
/// (spec.md §3 "ORD slot ... kind").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OrdKind {
    /// Decided normally via Pre-Prepare/Prepare/Commit.
    Commit,
    /// Installed during a view change by replaying a prepare-certificate
    /// (`PC_Set`) a prior leader had assembled.
    PcSet,
    /// Installed during a view change: no honest replica reported a
    /// prepare-certificate at this seq.
    NoOp,
    /// Like `NoOp`, but the slot had already been made eligible by a
    /// `ProofMatrix` before the view change started, so the PO
    /// eligibility bookkeeping for it must not be replayed.
    NoOpPlus,
}

/// One finalized entry in the ORD-layer decision log.
#[derive(Clone)]
pub struct OrdSlot {
    seq: SeqNo,
    view: View,
    kind: OrdKind,
    pre_prepare: Option<StoredMessage<ConsensusMessage>>,
    prepares: Vec<StoredMessage<ConsensusMessage>>,
    commits: Vec<StoredMessage<ConsensusMessage>>,
}

impl OrdSlot {
    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn kind(&self) -> OrdKind {
        self.kind
    }

    pub fn pre_prepare(&self) -> Option<&StoredMessage<ConsensusMessage>> {
        self.pre_prepare.as_ref()
    }

    pub fn prepares(&self) -> &[StoredMessage<ConsensusMessage>] {
        &self.prepares
    }

    pub fn commits(&self) -> &[StoredMessage<ConsensusMessage>] {
        &self.commits
    }
}

/// Subset of the log holding ORD-layer traffic for not-yet-finalized
/// slots, plus every finalized `OrdSlot` since the last checkpoint.
#[derive(Clone)]
pub struct DecisionLog {
    pre_prepares: Vec<StoredMessage<ConsensusMessage>>,
    prepares: Vec<StoredMessage<ConsensusMessage>>,
    commits: Vec<StoredMessage<ConsensusMessage>>,
    finalized: OrderedMap<SeqNo, OrdSlot>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self {
            pre_prepares: Vec::new(),
            prepares: Vec::new(),
            commits: Vec::new(),
            finalized: collections::ordered_map(),
        }
    }

    pub fn pre_prepares(&self) -> &[StoredMessage<ConsensusMessage>] {
        &self.pre_prepares
    }

    pub fn prepares(&self) -> &[StoredMessage<ConsensusMessage>] {
        &self.prepares
    }

    pub fn commits(&self) -> &[StoredMessage<ConsensusMessage>] {
        &self.commits
    }

    pub fn finalized_slots(&self) -> impl Iterator<Item = &OrdSlot> {
        self.finalized.values()
    }

    /// Installs a slot produced by the view-change replay path
    /// (`PC_Set`/`NoOp`/`NoOpPlus`), rather than this replica's own
    /// three-phase round.
    pub fn install_replayed_slot(&mut self, seq: SeqNo, view: View, kind: OrdKind) {
        self.finalized.insert(seq, OrdSlot {
            seq,
            view,
            kind,
            pre_prepare: None,
            prepares: Vec::new(),
            commits: Vec::new(),
        });
    }

    fn finalize_decided(&mut self, seq: SeqNo, view: View) {
        let pre_prepare = if !self.pre_prepares.is_empty() { Some(self.pre_prepares.remove(0)) } else { None };
        let prepares = std::mem::take(&mut self.prepares);
        let commits = std::mem::take(&mut self.commits);
        self.finalized.insert(seq, OrdSlot { seq, view, kind: OrdKind::Commit, pre_prepare, prepares, commits });
    }

    fn clear_below(&mut self, seq: SeqNo) {
        while let Some((&front, _)) = self.finalized.front() {
            if front < seq {
                self.finalized.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The message log: request storage plus the ORD-layer decision log.
pub struct Log<S, O> {
    curr_seq: SeqNo,
    batch_size: usize,
    declog: DecisionLog,
    requests: OrderedMap<Digest, StoredMessage<RequestMessage<O>>>,
    deciding: HashMap<Digest, StoredMessage<RequestMessage<O>>>,
    decided: Vec<O>,
    checkpoint: CheckpointState<S>,
}

impl<S, O> Log<S, O> {
    /// `batch_size` is the maximum number of client requests to queue
    /// before proposing a consensus instance.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            curr_seq: SeqNo::ZERO,
            declog: DecisionLog::new(),
            deciding: collections::hash_map_capacity(batch_size),
            decided: Vec::with_capacity(CATCHUP_HISTORY as usize),
            requests: collections::ordered_map(),
            checkpoint: CheckpointState::None,
        }
    }

    pub fn decision_log(&self) -> &DecisionLog {
        &self.declog
    }

    pub fn decision_log_mut(&mut self) -> &mut DecisionLog {
        &mut self.declog
    }

    pub fn current_checkpoint_seq(&self) -> Option<SeqNo> {
        match &self.checkpoint {
            CheckpointState::Complete(cp) => Some(cp.sequence_number()),
            _ => None,
        }
    }

    /// The most recent completed local checkpoint, if one has formed
    /// yet. `None` until the first `CATCHUP_HISTORY`-seq boundary
    /// finalizes.
    pub fn current_checkpoint(&self) -> Option<&Checkpoint<S>> {
        match &self.checkpoint {
            CheckpointState::Complete(cp) => Some(cp),
            _ => None,
        }
    }

    /// Every request decided since the current checkpoint, to replay
    /// atop it -- what a `CstMessage::ReplyState(_, Jump, _)` answer
    /// carries alongside the checkpoint's application state.
    pub fn decided_since_checkpoint(&self) -> &[O] {
        &self.decided
    }

    /// Adds a new `message` and its header to the log.
    pub fn insert(&mut self, header: Header, message: SystemMessage<O>) {
        match message {
            SystemMessage::Request(message) => {
                let digest = Digest::from_data(message.operation_id().to_le_bytes().as_ref());
                let stored = StoredMessage::new(header, message);
                self.requests.insert(digest, stored);
            }
            SystemMessage::Consensus(message) => {
                let stored = StoredMessage::new(header, message);
                match stored.message().kind() {
                    ConsensusMessageKind::PrePrepare(_) => self.declog.pre_prepares.push(stored),
                    ConsensusMessageKind::Prepare(_) => self.declog.prepares.push(stored),
                    ConsensusMessageKind::Commit(_) => self.declog.commits.push(stored),
                }
            }
            // every other kind is owned by its own subprotocol's state
            _ => (),
        }
    }

    /// Retrieves the next batch of requests available for proposing,
    /// once at least `batch_size` are queued.
    pub fn next_batch(&mut self) -> Option<Vec<Digest>> {
        let (digest, stored) = self.requests.pop_front()?;
        self.deciding.insert(digest, stored);
        if self.deciding.len() >= self.batch_size {
            Some(self.deciding.keys().copied().take(self.batch_size).collect())
        } else {
            None
        }
    }

    pub fn has_request(&self, digest: &Digest) -> bool {
        self.deciding.contains_key(digest) || self.requests.contains_key(digest)
    }

    pub fn clone_requests(&self, digests: &[Digest]) -> Vec<StoredMessage<RequestMessage<O>>>
    where
        O: Clone,
    {
        digests.iter()
            .flat_map(|d| self.deciding.get(d).or_else(|| self.requests.get(d)))
            .cloned()
            .collect()
    }

    /// Finalizes a decided batch, recording its `OrdSlot` and
    /// returning the batch's payload for the executor.
    pub fn finalize_batch(&mut self, seq: SeqNo, view: View, digests: &[Digest]) -> Result<(Info, UpdateBatch<O>)>
    where
        O: Clone,
    {
        let mut batch = UpdateBatch::new();
        for digest in digests {
            let (header, message) = self.deciding.remove(digest)
                .or_else(|| self.requests.remove(digest))
                .map(StoredMessage::into_inner)
                .ok_or_else(|| Error::simple(ErrorKind::Log))?;
            batch.add(header.from(), *digest, message.into_inner());
        }

        for update in batch.as_ref() {
            self.decided.push(update.operation().clone());
        }

        self.declog.finalize_decided(seq, view);
        self.curr_seq = seq;

        let seq_u32 = u32::from(seq);
        let info = if seq_u32 > 0 && seq_u32 % CATCHUP_HISTORY == 0 {
            self.begin_checkpoint(seq)?
        } else {
            Info::Nil
        };

        Ok((info, batch))
    }

    /// Installs a slot produced by a view-change replay rather than
    /// this replica's own three-phase round, advancing `curr_seq` to
    /// match.
    pub fn install_replayed_slot(&mut self, seq: SeqNo, view: View, kind: crate::bft::log::OrdKind) {
        self.declog.install_replayed_slot(seq, view, kind);
        if seq > self.curr_seq {
            self.curr_seq = seq;
        }
    }

    fn begin_checkpoint(&mut self, seq: SeqNo) -> Result<Info> {
        let earlier = std::mem::replace(&mut self.checkpoint, CheckpointState::None);
        self.checkpoint = match earlier {
            CheckpointState::None => CheckpointState::Partial { seq },
            CheckpointState::Complete(earlier) => CheckpointState::PartialWithEarlier { seq, earlier },
            _ => return Err("checkpoint already in progress").wrapped(ErrorKind::Log),
        };
        Ok(Info::BeginCheckpoint)
    }

    /// Completes an in-flight checkpoint with the application state
    /// handed back by the executor, clearing the decision log and
    /// decided-request history below the checkpoint's sequence number.
    pub fn finalize_checkpoint(&mut self, appstate: S) -> Result<()> {
        match self.checkpoint {
            CheckpointState::None => Err("no checkpoint has been initiated yet").wrapped(ErrorKind::Log),
            CheckpointState::Complete(_) => Err("checkpoint already finalized").wrapped(ErrorKind::Log),
            CheckpointState::Partial { seq } | CheckpointState::PartialWithEarlier { seq, .. } => {
                self.checkpoint = CheckpointState::Complete(Checkpoint { seq, appstate });
                self.decided.clear();
                self.declog.clear_below(seq);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::message::RequestMessage;
    use crate::bft::crypto::signature::KeyPair;

    fn dummy_header() -> Header {
        let kp = KeyPair::generate().unwrap();
        let digest = Digest::from_data(b"payload");
        let sig = kp.sign(&digest);
        crate::bft::communication::message::WireMessage::new(
            crate::bft::communication::NodeId::from(0u32),
            crate::bft::communication::NodeId::from(1u32),
            b"payload",
            Some(sig),
        ).into_inner().0
    }

    #[test]
    fn test_insert_then_next_batch_respects_batch_size() {
        let mut log: Log<(), u64> = Log::new(2);
        for i in 0..2u64 {
            let req = RequestMessage::new(0, i, i);
            log.insert(dummy_header(), SystemMessage::Request(req));
        }
        assert!(log.next_batch().is_none());
        let batch = log.next_batch();
        assert!(batch.is_some());
        assert_eq!(batch.unwrap().len(), 2);
    }
}
