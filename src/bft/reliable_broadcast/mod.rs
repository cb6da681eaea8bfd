//! Bracha-style reliable broadcast (spec.md §4.5), used as a building
//! block by `sync` (`Report`, `PcSet`) and `recovery`
//! (`ResetViewChange`, `ResetNewView`).
//!
//! One `RbSlot` exists per `(sender, view, seq)` tag -- here
//! represented by `communication::message::RbInstance` plus the
//! payload digest once known. Delivery requires `2f+k+1` matching
//! `Ready`s; `Ready`s are additionally emitted on `2f+k+1` `Echo`s or
//! `f+k+1` `Ready`s observed for a digest (Bracha amplification).

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::communication::message::RbInstance;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;

/// Quorum sizes for the reliable-broadcast primitive, matching
/// `consensus::Quorum`'s `f, k` parameterization.
#[derive(Debug, Copy, Clone)]
pub struct Quorum {
    pub f: usize,
    pub k: usize,
}

impl Quorum {
    /// `2f+k+1` echoes trigger amplification into a `Ready`.
    pub fn echo(&self) -> usize {
        2 * self.f + self.k + 1
    }

    /// `f+k+1` readies also trigger amplification into a `Ready`.
    pub fn ready_amplify(&self) -> usize {
        self.f + self.k + 1
    }

    /// `2f+k+1` readies deliver the broadcast.
    pub fn deliver(&self) -> usize {
        2 * self.f + self.k + 1
    }
}

/// Actions an `RbSlot` asks its caller to take after processing an
/// event: broadcast a message of its own, and/or report delivery.
#[derive(Default)]
pub struct RbOutcome {
    pub send_echo: Option<Digest>,
    pub send_ready: Option<Digest>,
    pub delivered: Option<Digest>,
}

struct RbSlot {
    init_payload: Option<Vec<u8>>,
    init_digest: Option<Digest>,
    echoed: bool,
    readied: bool,
    echoes: HashMap<NodeId, Digest>,
    readies: HashMap<NodeId, Digest>,
}

impl RbSlot {
    fn new() -> Self {
        Self {
            init_payload: None,
            init_digest: None,
            echoed: false,
            readied: false,
            echoes: collections::hash_map(),
            readies: collections::hash_map(),
        }
    }

    fn tally(votes: &HashMap<NodeId, Digest>, digest: Digest) -> usize {
        votes.values().filter(|d| **d == digest).count()
    }
}

/// Tracks every in-flight reliable-broadcast instance this replica is
/// a participant in, keyed by `RbInstance`.
pub struct ReliableBroadcast {
    quorum: Quorum,
    self_id: NodeId,
    slots: HashMap<RbInstance, RbSlot>,
    delivered: HashSet<RbInstance>,
}

impl ReliableBroadcast {
    pub fn new(quorum: Quorum, self_id: NodeId) -> Self {
        Self {
            quorum,
            self_id,
            slots: collections::hash_map(),
            delivered: collections::hash_set(),
        }
    }

    fn slot_mut(&mut self, instance: RbInstance) -> &mut RbSlot {
        self.slots.entry(instance).or_insert_with(RbSlot::new)
    }

    /// This replica is initiating a broadcast of `payload`. Returns
    /// the digest to be carried in the `Init` message, and causes this
    /// replica to echo its own init (Bracha's protocol has the sender
    /// echo too).
    pub fn initiate(&mut self, instance: RbInstance, payload: Vec<u8>) -> Digest {
        let digest = Digest::from_data(&payload);
        let self_id = self.self_id;
        let slot = self.slot_mut(instance);
        slot.init_payload = Some(payload);
        slot.init_digest = Some(digest);
        slot.echoed = true;
        slot.echoes.insert(self_id, digest);
        digest
    }

    /// An `Init` was received for `instance`, carrying `payload`.
    /// Triggers this replica's own `Echo`, unless already sent.
    pub fn on_init(&mut self, instance: RbInstance, payload: Vec<u8>) -> RbOutcome {
        let digest = Digest::from_data(&payload);
        let slot = self.slot_mut(instance);
        slot.init_payload = Some(payload);
        slot.init_digest = Some(digest);

        let mut outcome = RbOutcome::default();
        if !slot.echoed {
            slot.echoed = true;
            outcome.send_echo = Some(digest);
        }
        outcome
    }

    /// An `Echo(instance, digest)` was received from `from`.
    pub fn on_echo(&mut self, instance: RbInstance, from: NodeId, digest: Digest) -> RbOutcome {
        let quorum = self.quorum;
        let slot = self.slot_mut(instance);
        slot.echoes.insert(from, digest);

        let mut outcome = RbOutcome::default();
        if !slot.readied && RbSlot::tally(&slot.echoes, digest) >= quorum.echo() {
            slot.readied = true;
            outcome.send_ready = Some(digest);
        }
        outcome
    }

    /// A `Ready(instance, digest)` was received from `from`.
    pub fn on_ready(&mut self, instance: RbInstance, from: NodeId, digest: Digest) -> RbOutcome {
        let quorum = self.quorum;
        let already_delivered = self.delivered.contains(&instance);
        let slot = self.slot_mut(instance);
        slot.readies.insert(from, digest);
        let tally = RbSlot::tally(&slot.readies, digest);

        let mut outcome = RbOutcome::default();
        if !slot.readied && tally >= quorum.ready_amplify() {
            slot.readied = true;
            outcome.send_ready = Some(digest);
        }
        if !already_delivered && tally >= quorum.deliver() {
            outcome.delivered = Some(digest);
        }
        outcome
    }

    /// Marks `instance` delivered, so future `Ready`s don't re-report
    /// delivery. The payload is returned for the caller to interpret
    /// (deserialize into a `sync::Report`, `recovery::ResetViewChange`
    /// etc., depending on which subprotocol owns this instance).
    pub fn finish_delivery(&mut self, instance: RbInstance) -> Option<Vec<u8>> {
        self.delivered.insert(instance);
        self.slots.get(&instance).and_then(|s| s.init_payload.clone())
    }

    pub fn is_delivered(&self, instance: RbInstance) -> bool {
        self.delivered.contains(&instance)
    }

    /// Discards a finished instance's vote-tracking state once its
    /// payload has been consumed by the owning subprotocol.
    pub fn garbage_collect(&mut self, instance: RbInstance) {
        self.slots.remove(&instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quorum() -> Quorum {
        Quorum { f: 1, k: 1 } // echo=4, ready_amplify=3, deliver=4
    }

    fn instance() -> RbInstance {
        RbInstance { initiator: NodeId::from(0), instance_id: 1 }
    }

    #[test]
    fn test_echo_quorum_triggers_ready() {
        let mut rb = ReliableBroadcast::new(quorum(), NodeId::from(9));
        let payload = b"a report payload".to_vec();
        let outcome = rb.on_init(instance(), payload.clone());
        let digest = outcome.send_echo.unwrap();

        let mut last = RbOutcome::default();
        for r in 0..4 {
            last = rb.on_echo(instance(), NodeId::from(r), digest);
        }
        assert_eq!(last.send_ready, Some(digest));
    }

    #[test]
    fn test_ready_amplification_below_echo_threshold() {
        let mut rb = ReliableBroadcast::new(quorum(), NodeId::from(9));
        let digest = Digest::from_data(b"payload");
        let mut last = RbOutcome::default();
        for r in 0..3 {
            last = rb.on_ready(instance(), NodeId::from(r), digest);
        }
        assert_eq!(last.send_ready, Some(digest));
    }

    #[test]
    fn test_delivery_on_quorum_readies() {
        let mut rb = ReliableBroadcast::new(quorum(), NodeId::from(9));
        let digest = Digest::from_data(b"payload");
        let mut delivered = None;
        for r in 0..4 {
            let outcome = rb.on_ready(instance(), NodeId::from(r), digest);
            delivered = delivered.or(outcome.delivered);
        }
        assert_eq!(delivered, Some(digest));
    }
}
