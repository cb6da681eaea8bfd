//! View Change (spec.md §4.6): once Suspect-Leader collects a
//! `NewLeaderProof`, the Synchronizer takes over, collecting a
//! consistent prefix of prepared proposals from `2f+k+1` replicas and
//! replaying it under the new view.
//!
//! `cst` (the teacher's retrieved copy) already references a
//! `Synchronizer` it never defines; this module supplies it, with the
//! shape `cst::CollabStateTransfer` expects (`install_view`, `view()`).

use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::{SeqNo, View};

/// Quorum sizes, matching `consensus::Quorum`'s `f, k` shape.
#[derive(Debug, Copy, Clone)]
pub struct Quorum {
    pub f: usize,
    pub k: usize,
}

impl Quorum {
    pub fn prepare(&self) -> usize { 2 * self.f + self.k }
    pub fn commit(&self) -> usize { 2 * self.f + self.k + 1 }
    pub fn report(&self) -> usize { 2 * self.f + self.k + 1 }
    pub fn vc_sig_shares(&self) -> usize { self.f + self.k + 1 }
}

/// A single replica's view-change state: its reported `execARU` and
/// the prepare-certificates (`PC_Set`) it is replaying, one per seq.
#[derive(Clone, Default)]
pub struct ReportedState {
    pub exec_aru: Option<SeqNo>,
    pub pc_set: OrderedMap<SeqNo, Digest>,
    pub expected_pc_set_size: usize,
}

impl ReportedState {
    fn is_complete(&self) -> bool {
        self.exec_aru.is_some() && self.pc_set.len() >= self.expected_pc_set_size
    }
}

/// What the replayed ORD slot for a given seq resolves to, once the
/// new leader builds its `Replay` set (spec.md §4.6 "Replay").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReplayEntry {
    /// The unique prepare-certificate digest seen at this seq across
    /// the selected reports.
    PcSet(Digest),
    /// No honest replica in the selected set reported a
    /// prepare-certificate at this seq.
    NoOp,
}

/// Drives a single view-change round, targeting `target_view`.
pub struct Synchronizer {
    quorum: Quorum,
    current_view: View,
    target_view: View,

    reports: HashMap<NodeId, ReportedState>,
    vc_list_votes: HashMap<NodeId, (Vec<NodeId>, SeqNo)>,
    vc_partial_sigs: HashMap<NodeId, Vec<u8>>,
    vc_proof: Option<(Vec<NodeId>, SeqNo)>,

    replay: Option<OrderedMap<SeqNo, ReplayEntry>>,
    replay_prepares: HashMap<SeqNo, HashMap<NodeId, Digest>>,
    replay_commits: HashMap<SeqNo, HashMap<NodeId, Digest>>,
    installed: bool,

    /// Preserves a reset-view prepared proposal across reset-view
    /// changes (spec.md §4.8 "Carry-over").
    carried_over: Option<(SeqNo, Digest)>,
}

impl Synchronizer {
    pub fn new(current_view: View, quorum: Quorum) -> Self {
        Self {
            quorum,
            current_view,
            target_view: current_view.next(),
            reports: collections::hash_map(),
            vc_list_votes: collections::hash_map(),
            vc_partial_sigs: collections::hash_map(),
            vc_proof: None,
            replay: None,
            replay_prepares: collections::hash_map(),
            replay_commits: collections::hash_map(),
            installed: false,
            carried_over: None,
        }
    }

    pub fn view(&self) -> View {
        self.current_view
    }

    pub fn target_view(&self) -> View {
        self.target_view
    }

    /// Called once `suspect_leader` (or reset's own leader-election
    /// machinery) assembles a `NewLeaderProof`, starting this round.
    pub fn start(&mut self, target_view: View) {
        self.target_view = target_view;
        self.reports.clear();
        self.vc_list_votes.clear();
        self.vc_partial_sigs.clear();
        self.vc_proof = None;
        self.replay = None;
        self.replay_prepares.clear();
        self.replay_commits.clear();
        self.installed = false;
    }

    /// Records a `Report(execARU, pc_set_size)` delivered (via
    /// `reliable_broadcast`) from `from`.
    pub fn on_report(&mut self, from: NodeId, exec_aru: SeqNo, pc_set_size: usize) {
        let entry = self.reports.entry(from).or_insert_with(ReportedState::default);
        entry.exec_aru = Some(exec_aru);
        entry.expected_pc_set_size = pc_set_size;
    }

    /// Records one `PC_Set(seq, digest)` entry delivered from `from`.
    pub fn on_pc_set(&mut self, from: NodeId, entries: Vec<(SeqNo, Digest)>) {
        let entry = self.reports.entry(from).or_insert_with(ReportedState::default);
        for (seq, digest) in entries {
            entry.pc_set.insert(seq, digest);
        }
    }

    /// Number of replicas whose report + PC_Set are both complete.
    fn complete_reporters(&self) -> Vec<NodeId> {
        self.reports.iter()
            .filter(|(_, state)| state.is_complete())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Once `2f+k+1` complete reports exist, builds this replica's
    /// `VC_List`: the bitmask (here, explicit id list) of the selected
    /// reporters, plus the agreed `startSeq` (the minimum `execARU+1`
    /// among them).
    pub fn build_vc_list(&mut self) -> Option<(Vec<NodeId>, SeqNo)> {
        let mut complete = self.complete_reporters();
        if complete.len() < self.quorum.report() {
            return None;
        }
        complete.sort();
        complete.truncate(self.quorum.report());

        let start_seq = complete.iter()
            .filter_map(|id| self.reports.get(id).and_then(|s| s.exec_aru))
            .min()
            .unwrap_or(SeqNo::ZERO)
            .next();

        Some((complete, start_seq))
    }

    /// Records this replica's own (or a peer's) `VcList` vote.
    pub fn on_vc_list(&mut self, from: NodeId, list: Vec<NodeId>, start_seq: SeqNo) {
        self.vc_list_votes.insert(from, (list, start_seq));
    }

    /// Whether `from`'s `VcList` vote matches `candidate`, qualifying
    /// it to exchange a partial signature share.
    pub fn vc_list_matches(&self, from: NodeId, candidate: &(Vec<NodeId>, SeqNo)) -> bool {
        self.vc_list_votes.get(&from) == Some(candidate)
    }

    /// Records a partial threshold-signature share over `(list,
    /// start_seq)` from `from`.
    pub fn on_vc_partial_sig(&mut self, from: NodeId, share: Vec<u8>) -> usize {
        self.vc_partial_sigs.insert(from, share);
        self.vc_partial_sigs.len()
    }

    /// Whether `f+k+1` shares have been collected, ready to combine
    /// into a `VcProof`.
    pub fn has_vc_sig_quorum(&self) -> bool {
        self.vc_partial_sigs.len() >= self.quorum.vc_sig_shares()
    }

    /// Installs a validated `VcProof`, recording the selected report
    /// set so `build_replay` can walk it.
    pub fn install_vc_proof(&mut self, list: Vec<NodeId>, start_seq: SeqNo) {
        self.vc_proof = Some((list, start_seq));
    }

    pub fn vc_proof(&self) -> Option<&(Vec<NodeId>, SeqNo)> {
        self.vc_proof.as_ref()
    }

    /// The new leader's replay set (spec.md §4.6 "Replay"): for each
    /// seq in `[startSeq, max_exec_aru]`, the unique prepare-cert seen
    /// across the selected reports, else `NoOp`.
    pub fn build_replay(&mut self, max_exec_aru: SeqNo) -> OrderedMap<SeqNo, ReplayEntry> {
        let (list, start_seq) = match &self.vc_proof {
            Some(v) => v.clone(),
            None => return collections::ordered_map(),
        };

        let mut replay = collections::ordered_map();
        let mut seq = start_seq;
        while seq <= max_exec_aru {
            let mut digests: HashMap<Digest, usize> = collections::hash_map();
            for id in &list {
                if let Some(state) = self.reports.get(id) {
                    if let Some(d) = state.pc_set.get(&seq) {
                        *digests.entry(*d).or_insert(0) += 1;
                    }
                }
            }
            // any honest replica reporting a prepare-cert is enough:
            // with I2, at most one honest digest can exist per seq
            let entry = digests.into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(d, _)| ReplayEntry::PcSet(d))
                .unwrap_or(ReplayEntry::NoOp);
            replay.insert(seq, entry);
            seq = seq.next();
            if seq == start_seq {
                break; // SeqNo wrapped around; avoid an infinite loop
            }
        }

        self.replay = Some(replay.clone());
        replay
    }

    /// Records a `ReplayPrepare(digest)` vote for `seq` from `from`.
    pub fn on_replay_prepare(&mut self, seq: SeqNo, from: NodeId, digest: Digest) -> usize {
        let votes = self.replay_prepares.entry(seq).or_insert_with(collections::hash_map);
        votes.insert(from, digest);
        votes.values().filter(|d| **d == digest).count()
    }

    pub fn replay_prepare_quorum_met(&self, seq: SeqNo, digest: Digest) -> bool {
        self.replay_prepares.get(&seq)
            .map(|votes| votes.values().filter(|d| **d == digest).count() >= self.quorum.prepare())
            .unwrap_or(false)
    }

    /// Records a `ReplayCommit(digest)` vote for `seq` from `from`.
    pub fn on_replay_commit(&mut self, seq: SeqNo, from: NodeId, digest: Digest) -> usize {
        let votes = self.replay_commits.entry(seq).or_insert_with(collections::hash_map);
        votes.insert(from, digest);
        votes.values().filter(|d| **d == digest).count()
    }

    pub fn replay_commit_quorum_met(&self, seq: SeqNo, digest: Digest) -> bool {
        self.replay_commits.get(&seq)
            .map(|votes| votes.values().filter(|d| **d == digest).count() >= self.quorum.commit())
            .unwrap_or(false)
    }

    /// Whether every seq in the replay set has reached a
    /// `ReplayCommit` quorum, meaning the new view may install.
    pub fn replay_fully_committed(&self) -> bool {
        match &self.replay {
            Some(replay) => replay.iter().all(|(seq, entry)| {
                let digest = match entry {
                    ReplayEntry::PcSet(d) => *d,
                    ReplayEntry::NoOp => Digest::from_data(b"NO_OP"),
                };
                self.replay_commit_quorum_met(*seq, digest)
            }),
            None => false,
        }
    }

    /// Installs `target_view` as the current view, completing this
    /// round.
    pub fn install_view(&mut self) -> View {
        self.current_view = self.target_view;
        self.installed = true;
        self.current_view
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Preserves `(seq, digest)` across a reset-view change (spec.md
    /// §4.8 "Carry-over").
    pub fn carry_over(&mut self, seq: SeqNo, digest: Digest) {
        self.carried_over = Some((seq, digest));
    }

    pub fn carried_over(&self) -> Option<(SeqNo, Digest)> {
        self.carried_over
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quorum() -> Quorum {
        Quorum { f: 1, k: 1 } // report=4, prepare=3, commit=4, sig_shares=3
    }

    #[test]
    fn test_vc_list_requires_quorum_complete_reports() {
        let mut s = Synchronizer::new(View::FIRST, quorum());
        for r in 0..3 {
            s.on_report(NodeId::from(r), SeqNo::from(5u32), 0);
        }
        assert!(s.build_vc_list().is_none(), "needs 2f+k+1=4 complete reports");
        s.on_report(NodeId::from(3), SeqNo::from(5u32), 0);
        assert!(s.build_vc_list().is_some());
    }

    #[test]
    fn test_replay_picks_majority_digest_else_noop() {
        let mut s = Synchronizer::new(View::FIRST, quorum());
        let d = Digest::from_data(b"a prepared proposal");
        for r in 0..4u32 {
            s.on_report(NodeId::from(r), SeqNo::from(10u32), 1);
        }
        s.on_pc_set(NodeId::from(0), vec![(SeqNo::from(10u32), d)]);
        s.on_pc_set(NodeId::from(1), vec![(SeqNo::from(10u32), d)]);
        let list = s.build_vc_list().unwrap();
        s.install_vc_proof(list.0, list.1);
        let replay = s.build_replay(SeqNo::from(10u32));
        assert_eq!(replay.get(&SeqNo::from(10u32)), Some(&ReplayEntry::PcSet(d)));
    }

    #[test]
    fn test_replay_no_op_when_nobody_reports_a_cert() {
        let mut s = Synchronizer::new(View::FIRST, quorum());
        for r in 0..4u32 {
            s.on_report(NodeId::from(r), SeqNo::from(10u32), 0);
        }
        let list = s.build_vc_list().unwrap();
        s.install_vc_proof(list.0, list.1);
        let replay = s.build_replay(SeqNo::from(10u32));
        assert_eq!(replay.get(&SeqNo::from(10u32)), Some(&ReplayEntry::NoOp));
    }
}
