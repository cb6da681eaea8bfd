//! A timer wheel used by `core::server`'s dispatcher to schedule the
//! periodic and one-shot callbacks driving every subprotocol: signing
//! flushes, PO_ARU broadcasts, Pre_Prepare emission, suspect-leader
//! pings, view-change timeouts, catchup retries, reset-proposal
//! broadcasts.
//!
//! Scheduling is deadline-first, ties broken by insertion order, kept
//! in a `BinaryHeap` the way a priority queue of timers is usually
//! built in Rust rather than a literal wheel of buckets.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::bft::communication::NodeId;

/// The kind of event a fired timeout corresponds to, so the
/// dispatcher can route it to the right subprotocol without decoding
/// an opaque payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TimeoutKind {
    /// A catchup/jump request is due a retry.
    Cst,
    /// The suspect-leader subprotocol's ping or TAT measurement timer.
    SuspectLeader,
    /// A view-change (synchronizer) timeout.
    ViewChange,
    /// A periodic catchup probe, independent of a pending request.
    Catchup,
    /// The reset-proposal re-broadcast timer.
    ResetProposal,
    /// The signing pipeline's `sig_min_time`/`sig_max_time` flush timer.
    SigFlush,
    /// The periodic PO_ARU broadcast timer.
    PoAru,
    /// The leader's `pre_prepare_sw` timer.
    PrePrepare,
}

/// Identifies a single scheduled timeout: its kind, an optional
/// sub-id disambiguating multiple concurrent timers of the same kind
/// (e.g. one `Cst` retry per helper `NodeId`), and a generation
/// counter that lets `cancel`/re-queue invalidate a stale entry
/// without having to remove it from the heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimeoutId {
    pub kind: TimeoutKind,
    pub sub_id: u64,
}

impl TimeoutId {
    pub fn new(kind: TimeoutKind, sub_id: u64) -> Self {
        Self { kind, sub_id }
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    id: TimeoutId,
    generation: u64,
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for Entry {
    // reversed: `BinaryHeap` is a max-heap, we want the smallest
    // deadline first, ties broken by the smallest insertion sequence
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The timer wheel itself.
///
/// Cancellation is idempotent and keyed by `TimeoutId`: rather than
/// scanning the heap, each id's current generation is bumped, and a
/// popped entry whose generation doesn't match the live one is
/// silently discarded. Re-queuing a pending timer replaces its
/// deadline by bumping the generation and pushing a fresh entry, so
/// the stale one lapses the same way.
pub struct Timeouts {
    heap: BinaryHeap<Entry>,
    generations: crate::bft::collections::HashMap<TimeoutId, u64>,
    next_seq: u64,
}

impl Timeouts {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            generations: crate::bft::collections::hash_map(),
            next_seq: 0,
        }
    }

    /// Schedules `id` to fire after `after` elapses from now. If `id`
    /// was already scheduled, its old entry is invalidated and this
    /// call replaces its deadline.
    pub fn schedule(&mut self, id: TimeoutId, after: Duration) {
        let generation = self.generations.entry(id).or_insert(0);
        *generation += 1;
        let generation = *generation;

        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Entry {
            deadline: Instant::now() + after,
            seq,
            id,
            generation,
        });
    }

    /// Cancels `id`, if scheduled. Idempotent: cancelling an id that
    /// isn't currently scheduled is a no-op.
    pub fn cancel(&mut self, id: TimeoutId) {
        if let Some(generation) = self.generations.get_mut(&id) {
            *generation += 1;
        }
    }

    /// Pops every timer whose deadline has elapsed, in deadline order
    /// (ties broken by schedule order), discarding entries that were
    /// cancelled or superseded by a later `schedule` call.
    pub fn drain_expired(&mut self) -> Vec<TimeoutId> {
        let now = Instant::now();
        let mut fired = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            let live = self.generations.get(&entry.id).copied().unwrap_or(0);
            if live == entry.generation {
                fired.push(entry.id);
            }
        }

        fired
    }

    /// The duration until the next live timer fires, if any is
    /// scheduled. Used by the dispatcher to bound how long it may
    /// block polling the transport and client-IPC descriptors.
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .iter()
            .filter(|e| self.generations.get(&e.id).copied().unwrap_or(0) == e.generation)
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new()
    }
}

/// Scopes a `TimeoutId` to a particular peer, for per-source timers
/// like catchup retries (`next_catchup_time[r]`) or suspect-leader
/// ping deadlines.
pub fn sub_id_for_node(id: NodeId) -> u64 {
    u32::from(id) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_drain_expired_in_deadline_order() {
        let mut t = Timeouts::new();
        t.schedule(TimeoutId::new(TimeoutKind::PoAru, 0), Duration::from_millis(20));
        t.schedule(TimeoutId::new(TimeoutKind::SigFlush, 0), Duration::from_millis(5));
        sleep(Duration::from_millis(30));
        let fired = t.drain_expired();
        assert_eq!(fired, vec![
            TimeoutId::new(TimeoutKind::SigFlush, 0),
            TimeoutId::new(TimeoutKind::PoAru, 0),
        ]);
    }

    #[test]
    fn test_cancel_is_idempotent_and_suppresses_fire() {
        let mut t = Timeouts::new();
        let id = TimeoutId::new(TimeoutKind::Cst, 7);
        t.schedule(id, Duration::from_millis(5));
        t.cancel(id);
        t.cancel(id);
        sleep(Duration::from_millis(15));
        assert!(t.drain_expired().is_empty());
    }

    #[test]
    fn test_requeue_replaces_deadline() {
        let mut t = Timeouts::new();
        let id = TimeoutId::new(TimeoutKind::ViewChange, 0);
        t.schedule(id, Duration::from_millis(5));
        t.schedule(id, Duration::from_millis(50));
        sleep(Duration::from_millis(15));
        // the earlier, now-stale entry must not fire
        assert!(t.drain_expired().is_empty());
    }
}
