//! The Pre-Order (PO) layer: per-originator sequencing of client
//! updates, witnessed by threshold acknowledgements before the
//! Global-Order layer may make them eligible for execution.
//!
//! Grounded on `original_source/prime/src/data_structs.h`'s PO slot
//! fields, and on the teacher's `log::StoredMessage` arena-by-handle
//! pattern (slots hold a `StoredMessage`, not inline copies spread
//! across multiple containers).

use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::message::{Header, PreOrderMessage, RequestMessage};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::{Incarnation, PoSeqPair, SeqNo};

/// The lifecycle of a single PO slot, per spec.md §4.2.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PoSlotState {
    /// Nothing stored for this `(originator, seq)` yet.
    Absent,
    /// The `PO_Request` itself has been stored.
    Stored,
    /// This replica has sent its own `PO_Ack` for the slot.
    Acked,
    /// `2f+k+1` distinct `PO_Ack`s on a matching digest have been
    /// collected: the slot has a PO proof.
    Witnessed,
    /// The owning ORD slot that made this PO slot eligible has
    /// executed it.
    Executed,
}

/// A PO slot keyed by `(originator, seq)`.
pub struct PoSlot<O> {
    request: Option<(Header, RequestMessage<O>)>,
    digest: Option<Digest>,
    acks: HashMap<NodeId, Digest>,
    state: PoSlotState,
}

impl<O> PoSlot<O> {
    fn new() -> Self {
        Self {
            request: None,
            digest: None,
            acks: collections::hash_map(),
            state: PoSlotState::Absent,
        }
    }

    pub fn state(&self) -> PoSlotState {
        self.state
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn request(&self) -> Option<&RequestMessage<O>> {
        self.request.as_ref().map(|(_, m)| m)
    }

    pub fn header(&self) -> Option<&Header> {
        self.request.as_ref().map(|(h, _)| h)
    }

    /// Number of distinct replicas that have acked this slot's digest.
    pub fn ack_count(&self) -> usize {
        self.acks.len()
    }
}

/// Per-replica Pre-Order state (spec.md's "Per-replica PO tables").
///
/// One `PoTable` instance is kept per originator `r` this replica is
/// tracking -- including its own.
pub struct PoTable<O> {
    originator: NodeId,
    slots: OrderedMap<u64, PoSlot<O>>,
    /// Own contiguous reception frontier: the highest `seq_num` such
    /// that every PO_Request up to and including it has been stored.
    aru: u64,
    /// `2f+k+1`-witnessed contiguous frontier.
    cum_aru: u64,
    /// Set when `cum_aru` advances; cleared by the next scheduled
    /// `PO_ARU` broadcast (duplicate-suppression flag).
    cum_aru_dirty: bool,
    incarnation: Incarnation,
}

impl<O> PoTable<O> {
    pub fn new(originator: NodeId) -> Self {
        Self {
            originator,
            slots: collections::ordered_map(),
            aru: 0,
            cum_aru: 0,
            cum_aru_dirty: false,
            incarnation: Incarnation::from(0),
        }
    }

    pub fn originator(&self) -> NodeId {
        self.originator
    }

    pub fn aru(&self) -> u64 {
        self.aru
    }

    pub fn cum_aru(&self) -> u64 {
        self.cum_aru
    }

    pub fn current_incarnation(&self) -> Incarnation {
        self.incarnation
    }

    fn slot_mut(&mut self, seq_num: u64) -> &mut PoSlot<O> {
        if !self.slots.contains_key(&seq_num) {
            self.slots.insert(seq_num, PoSlot::new());
        }
        self.slots.get_mut(&seq_num).unwrap()
    }

    pub fn slot(&self, seq_num: u64) -> Option<&PoSlot<O>> {
        self.slots.get(&seq_num)
    }

    /// Stores a freshly-received `PO_Request` at `seq`, provided it
    /// contiguously extends `aru` (I1: at most one `PO_Request` is
    /// stored per `(r, s)`). Returns the request's digest when stored,
    /// for immediate ack-part emission.
    ///
    /// `digest_of` serializes and hashes the request; kept as a
    /// closure parameter so this module stays agnostic of `O`'s wire
    /// representation.
    pub fn on_po_request_received<F>(
        &mut self,
        header: Header,
        seq: PoSeqPair,
        message: RequestMessage<O>,
        digest_of: F,
    ) -> Option<Digest>
    where
        F: FnOnce(&RequestMessage<O>) -> Digest,
    {
        if seq.incarnation() != self.incarnation {
            // a higher incarnation resets this originator's sequence
            // space; a lower one is stale and dropped
            if seq.incarnation() < self.incarnation {
                return None;
            }
            self.incarnation = seq.incarnation();
            self.slots.clear();
            self.aru = 0;
            self.cum_aru = 0;
        }

        let seq_num = u32::from(seq.seq_num()) as u64;
        if self.slots.contains_key(&seq_num) {
            // I1: already stored, no duplicate accepted
            return None;
        }

        let digest = digest_of(&message);
        {
            let slot = self.slot_mut(seq_num);
            slot.request = Some((header, message));
            slot.digest = Some(digest);
            slot.state = PoSlotState::Stored;
        }

        // advance the contiguous frontier
        while self.slots.get(&(self.aru + 1)).map_or(false, |s| s.request.is_some()) {
            self.aru += 1;
        }

        Some(digest)
    }

    /// Marks this replica's own ack as sent.
    pub fn mark_own_ack_sent(&mut self, seq_num: u64) {
        if let Some(slot) = self.slots.get_mut(&seq_num) {
            if slot.state == PoSlotState::Stored {
                slot.state = PoSlotState::Acked;
            }
        }
    }

    /// Records a `PO_Ack` part from `from` for `seq_num` on `digest`,
    /// returning the new ack count. Acks on a digest other than the
    /// one stored locally are evidence of equivocation and are
    /// reported via the `Err` branch rather than silently counted.
    pub fn on_ack_received(&mut self, from: NodeId, seq_num: u64, digest: Digest) -> Result<usize> {
        let slot = self.slot_mut(seq_num);
        if let Some(local_digest) = slot.digest {
            if local_digest != digest {
                return Err("PO_Ack digest does not match the stored PO_Request")
                    .wrapped(ErrorKind::Preorder);
            }
        }
        slot.acks.insert(from, digest);
        Ok(slot.acks.len())
    }

    /// Call after `on_ack_received` once the witness threshold
    /// (`2f+k+1`) is known to have been reached by the caller, marking
    /// the slot `Witnessed` and advancing `cum_aru` if this is now the
    /// contiguous witnessed frontier.
    pub fn on_witnessed(&mut self, seq_num: u64) {
        if let Some(slot) = self.slots.get_mut(&seq_num) {
            slot.state = PoSlotState::Witnessed;
        }
        while self.slots
            .get(&(self.cum_aru + 1))
            .map_or(false, |s| s.state == PoSlotState::Witnessed || s.state == PoSlotState::Executed)
        {
            self.cum_aru += 1;
        }
        self.cum_aru_dirty = true;
    }

    /// Marks a slot executed once the owning ORD slot has delivered
    /// its contained update to the application.
    pub fn mark_executed(&mut self, seq_num: u64) {
        if let Some(slot) = self.slots.get_mut(&seq_num) {
            slot.state = PoSlotState::Executed;
        }
    }

    /// Takes and clears the `cum_aru`-advanced flag, for the
    /// duplicate-suppressing `PO_ARU` broadcast timer.
    pub fn take_cum_aru_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.cum_aru_dirty, false)
    }

    /// Garbage-collects every slot with `seq_num <= through`, once the
    /// owning ORD slot has itself been garbage-collected (spec.md
    /// §4.2's last line: PO GC is deferred to ORD GC).
    pub fn garbage_collect(&mut self, through: u64) {
        while let Some((&seq_num, _)) = self.slots.front() {
            if seq_num > through {
                break;
            }
            self.slots.pop_front();
        }
    }
}

/// Builds the `PoAck` announcement for every `PoSlot` this replica has
/// stored but not yet acked, for a given originator's table.
pub fn pending_acks<O>(table: &PoTable<O>) -> Vec<(u64, Digest)> {
    table.slots.iter()
        .filter(|(_, slot)| slot.state == PoSlotState::Stored)
        .filter_map(|(&seq_num, slot)| slot.digest.map(|d| (seq_num, d)))
        .collect()
}

/// Computes eligibility (spec.md §4.2 "Eligibility (Proof_ARU)"): given
/// a `2f+k+1`-wide column of `PO_Aru` announcements for originator `r`
/// (each a `PoSeqPair` reported by a distinct replica), the
/// `(f+k+1)`-th highest value is the eligible frontier for `r`.
///
/// `column` need not be pre-sorted; `quorum_index` is `f+k` (zero
/// based index of the `(f+k+1)`-th highest element once sorted
/// descending).
pub fn eligible_frontier(mut column: Vec<PoSeqPair>, quorum_index: usize) -> Option<PoSeqPair> {
    if quorum_index >= column.len() {
        return None;
    }
    column.sort_unstable_by(|a, b| b.cmp(a));
    Some(column[quorum_index])
}

/// Builds a `PreOrderMessage::ProofMatrix` row for a single originator
/// out of the `(NodeId, PoSeqPair, Digest)` evidence a replica has
/// collected for it -- one row per originator is assembled by
/// `consensus` into the full `ProofMatrix` carried in a `Pre_Prepare`.
pub fn proof_matrix_row<O>(
    seq: SeqNo,
    rows: Vec<(NodeId, PoSeqPair, Digest)>,
) -> PreOrderMessage<O> {
    PreOrderMessage::ProofMatrix(seq, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::hash::Digest as Dg;

    fn digest_of_noop<O>(_m: &RequestMessage<O>) -> Dg {
        Dg::from_data(b"fixed-digest-for-tests")
    }

    fn header() -> Header {
        // headers in tests only need to round-trip; signature content
        // is irrelevant for PO-table bookkeeping
        let (h, _) = crate::bft::communication::message::WireMessage::new(
            NodeId::from(0), NodeId::from(1), &[], None,
        ).into_inner();
        h
    }

    #[test]
    fn test_contiguous_reception_advances_aru() {
        let mut table: PoTable<u32> = PoTable::new(NodeId::from(0));
        let inc = Incarnation::from(0);
        for n in 1..=3u64 {
            let seq = PoSeqPair::new(inc, SeqNo::from(n as u32));
            let msg = RequestMessage::new(0, n, 7u32);
            table.on_po_request_received(header(), seq, msg, digest_of_noop);
        }
        assert_eq!(table.aru(), 3);
    }

    #[test]
    fn test_gap_blocks_aru_advance() {
        let mut table: PoTable<u32> = PoTable::new(NodeId::from(0));
        let inc = Incarnation::from(0);
        let seq1 = PoSeqPair::new(inc, SeqNo::from(1u32));
        let seq3 = PoSeqPair::new(inc, SeqNo::from(3u32));
        table.on_po_request_received(header(), seq1, RequestMessage::new(0, 1, 1u32), digest_of_noop);
        table.on_po_request_received(header(), seq3, RequestMessage::new(0, 3, 3u32), digest_of_noop);
        assert_eq!(table.aru(), 1);
    }

    #[test]
    fn test_mismatched_ack_digest_is_rejected() {
        let mut table: PoTable<u32> = PoTable::new(NodeId::from(0));
        let inc = Incarnation::from(0);
        let seq1 = PoSeqPair::new(inc, SeqNo::from(1u32));
        table.on_po_request_received(header(), seq1, RequestMessage::new(0, 1, 1u32), digest_of_noop);
        let bad = Dg::from_data(b"a different payload entirely");
        assert!(table.on_ack_received(NodeId::from(1), 1, bad).is_err());
    }

    #[test]
    fn test_witnessed_advances_cum_aru_and_sets_dirty() {
        let mut table: PoTable<u32> = PoTable::new(NodeId::from(0));
        let inc = Incarnation::from(0);
        let seq1 = PoSeqPair::new(inc, SeqNo::from(1u32));
        table.on_po_request_received(header(), seq1, RequestMessage::new(0, 1, 1u32), digest_of_noop);
        table.on_witnessed(1);
        assert_eq!(table.cum_aru(), 1);
        assert!(table.take_cum_aru_dirty());
        assert!(!table.take_cum_aru_dirty());
    }

    #[test]
    fn test_eligible_frontier_picks_f_plus_k_plus_1_highest() {
        let inc = Incarnation::from(0);
        let col = vec![
            PoSeqPair::new(inc, SeqNo::from(5u32)),
            PoSeqPair::new(inc, SeqNo::from(3u32)),
            PoSeqPair::new(inc, SeqNo::from(4u32)),
            PoSeqPair::new(inc, SeqNo::from(1u32)),
        ];
        // f+k+1 = 2 -> zero-based index 1 -> second highest
        let frontier = eligible_frontier(col, 1).unwrap();
        assert_eq!(frontier, PoSeqPair::new(inc, SeqNo::from(4u32)));
    }
}
