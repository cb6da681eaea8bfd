//! Suspect-Leader (spec.md §4.4): measures how long the current
//! leader takes to turn a Proof_Matrix around into a Pre_Prepare, and
//! independently estimates an acceptable ceiling for that latency
//! from peer round-trip times, voting to replace the leader when the
//! measured value sustains above the ceiling.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::NodeId;
use crate::bft::ordering::View;

const TAT_WINDOW: usize = 16;
const RTT_HISTORY: usize = 10;

/// `K_Lat` scales a measured RTT into an expected turn-around time;
/// `pp_time` is the fixed cost of assembling and signing a
/// Pre_Prepare, added on top.
#[derive(Debug, Copy, Clone)]
pub struct TatModel {
    pub k_lat: f64,
    pub pp_time: Duration,
}

impl TatModel {
    fn tat_if_leader(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.k_lat) + self.pp_time
    }
}

/// Tracks this replica's view of the current leader's performance,
/// and of its own candidacy, to decide whether to vote `NewLeader`.
pub struct SuspectLeader {
    n: usize,
    quorum_index: usize, // zero-based index of the (f+k+1)-th value
    model: TatModel,

    turnaround_times: VecDeque<Duration>,
    max_tat: Option<Duration>,
    reported_tats: HashMap<NodeId, Duration>,

    rtt_history: HashMap<NodeId, VecDeque<Duration>>,
    pending_pings: HashMap<NodeId, (u64, Instant)>,
    tat_if_leader: HashMap<NodeId, Duration>,
    alpha: Option<Duration>,
    reported_ubs: HashMap<NodeId, Duration>,
    tat_acceptable: Option<Duration>,

    suspected_view: Option<View>,
    new_leader_votes: HashMap<NodeId, ()>,
    equivocation_tally: HashMap<View, usize>,

    pending_proof_matrix_sent_at: Option<Instant>,
    next_ping_nonce: u64,
}

impl SuspectLeader {
    pub fn new(n: usize, f: usize, k: usize, model: TatModel) -> Self {
        Self {
            n,
            quorum_index: f + k, // (f+k+1)-th element, zero-based
            model,
            turnaround_times: VecDeque::with_capacity(TAT_WINDOW),
            max_tat: None,
            reported_tats: collections::hash_map(),
            rtt_history: collections::hash_map(),
            pending_pings: collections::hash_map(),
            tat_if_leader: collections::hash_map(),
            alpha: None,
            reported_ubs: collections::hash_map(),
            tat_acceptable: None,
            suspected_view: None,
            new_leader_votes: collections::hash_map(),
            equivocation_tally: collections::hash_map(),
            pending_proof_matrix_sent_at: None,
            next_ping_nonce: 0,
        }
    }

    fn quorum_value(column: &HashMap<NodeId, Duration>, index: usize) -> Option<Duration> {
        if column.len() <= index {
            return None;
        }
        let mut values: Vec<Duration> = column.values().copied().collect();
        values.sort_unstable_by(|a, b| b.cmp(a));
        values.get(index).copied()
    }

    /// Records the instant a Proof_Matrix this replica sent (as
    /// leader) was emitted, starting a TAT measurement window.
    pub fn mark_proof_matrix_sent(&mut self, at: Instant) {
        self.pending_proof_matrix_sent_at = Some(at);
    }

    /// Records acceptance of the next-expected Pre_Prepare covering a
    /// previously marked Proof_Matrix, closing the measurement window.
    /// Returns `Some(max_tat)` if the rolling maximum changed, meaning
    /// a rate-limited `TatMeasure` broadcast is due.
    pub fn mark_pre_prepare_accepted(&mut self, at: Instant) -> Option<Duration> {
        let sent_at = self.pending_proof_matrix_sent_at.take()?;
        let tat = at.saturating_duration_since(sent_at);

        if self.turnaround_times.len() == TAT_WINDOW {
            self.turnaround_times.pop_front();
        }
        self.turnaround_times.push_back(tat);

        let new_max = self.turnaround_times.iter().max().copied().unwrap();
        if self.max_tat != Some(new_max) {
            self.max_tat = Some(new_max);
            Some(new_max)
        } else {
            None
        }
    }

    /// Records a peer's reported `TatMeasure(view, tat)`.
    pub fn on_tat_measure(&mut self, from: NodeId, tat: Duration) {
        self.reported_tats.insert(from, tat);
    }

    /// The `(f+k+1)`-th lowest reported TAT, i.e. `tat_leader`: the
    /// value the view's leader is being judged against.
    pub fn tat_leader(&self) -> Option<Duration> {
        // "lowest" of the reported_tats column, f+k+1-th when sorted
        // ascending == len - 1 - quorum_index-th when sorted descending
        if self.reported_tats.len() <= self.quorum_index {
            return None;
        }
        let mut values: Vec<Duration> = self.reported_tats.values().copied().collect();
        values.sort_unstable();
        values.get(self.quorum_index).copied()
    }

    /// Issues a fresh `RttPing` nonce, remembering when it was sent.
    pub fn ping(&mut self, to: NodeId, at: Instant) -> u64 {
        let nonce = self.next_ping_nonce;
        self.next_ping_nonce += 1;
        self.pending_pings.insert(to, (nonce, at));
        nonce
    }

    /// Processes an `RttPong(nonce)` from `from`, recording the RTT if
    /// the nonce matches the outstanding ping.
    pub fn on_pong(&mut self, from: NodeId, nonce: u64, at: Instant) {
        if let Some((pending_nonce, sent_at)) = self.pending_pings.get(&from).copied() {
            if pending_nonce == nonce {
                self.pending_pings.remove(&from);
                let rtt = at.saturating_duration_since(sent_at);
                let history = self.rtt_history.entry(from).or_insert_with(VecDeque::new);
                if history.len() == RTT_HISTORY {
                    history.pop_front();
                }
                history.push_back(rtt);

                let tat = self.model.tat_if_leader(rtt);
                self.tat_if_leader.insert(from, tat);
            }
        }
    }

    /// This replica's own TAT upper-bound (`alpha`): the `(f+k+1)`-th
    /// highest `tat_if_leader` value across every candidate leader.
    pub fn compute_alpha(&mut self) -> Option<Duration> {
        let alpha = Self::quorum_value(&self.tat_if_leader, self.quorum_index);
        self.alpha = alpha;
        alpha
    }

    /// Records a peer's reported `TAT_UB` (their own `alpha`).
    pub fn on_tat_ub(&mut self, from: NodeId, ub: Duration) {
        self.reported_ubs.insert(from, ub);
    }

    /// `tat_acceptable`: the `(f+k+1)`-th highest reported `TAT_UB`.
    pub fn compute_tat_acceptable(&mut self) -> Option<Duration> {
        let acceptable = Self::quorum_value(&self.reported_ubs, self.quorum_index);
        self.tat_acceptable = acceptable;
        acceptable
    }

    pub fn tat_acceptable(&self) -> Option<Duration> {
        self.tat_acceptable
    }

    pub fn alpha(&self) -> Option<Duration> {
        self.alpha
    }

    /// Whether the measured leader TAT has sustained above the
    /// acceptable ceiling, and this view hasn't already been
    /// suspected (at most one suspicion per view).
    pub fn should_suspect(&self, view: View) -> bool {
        if self.suspected_view == Some(view) {
            return false;
        }
        match (self.tat_leader(), self.tat_acceptable) {
            (Some(leader), Some(acceptable)) => leader > acceptable,
            _ => false,
        }
    }

    /// Marks `view` as suspected, so `should_suspect` won't fire again
    /// for it. Call right before broadcasting `NewLeader(view.next())`.
    pub fn mark_suspected(&mut self, view: View) {
        self.suspected_view = Some(view);
        self.new_leader_votes.clear();
    }

    /// Tallies a directly-witnessed equivocation (a conflicting
    /// Pre_Prepare, or a second differing vote from the same peer) for
    /// `view`'s leader -- spec.md's `EquivocationEvidence`, fed into
    /// this subprotocol rather than discarded. Unlike a TAT overrun, a
    /// pair of signed conflicting messages is conclusive on its own, so
    /// the first tally already warrants a suspicion; the running count
    /// is kept for observability. Returns `true` the first time `view`
    /// is suspected this way (gated the same as `should_suspect`, at
    /// most one suspicion per view).
    pub fn record_equivocation(&mut self, view: View) -> bool {
        *self.equivocation_tally.entry(view).or_insert(0) += 1;
        self.suspected_view != Some(view)
    }

    /// How many equivocation events have been tallied for `view`.
    pub fn equivocation_count(&self, view: View) -> usize {
        self.equivocation_tally.get(&view).copied().unwrap_or(0)
    }

    /// Records a `NewLeader(view+1)` vote from `from`.
    pub fn on_new_leader_vote(&mut self, from: NodeId) -> usize {
        self.new_leader_votes.insert(from, ());
        self.new_leader_votes.len()
    }

    /// Whether `2f+k+1` distinct `NewLeader` votes have been collected.
    pub fn has_new_leader_quorum(&self, f: usize, k: usize) -> bool {
        self.new_leader_votes.len() >= 2 * f + k + 1
    }

    /// Resets per-view state once a new view has installed, so the new
    /// view's leader gets a clean TAT measurement window.
    pub fn on_view_installed(&mut self) {
        self.suspected_view = None;
        self.new_leader_votes.clear();
        self.equivocation_tally.clear();
        self.turnaround_times.clear();
        self.max_tat = None;
        self.reported_tats.clear();
        self.pending_proof_matrix_sent_at = None;
    }

    pub fn n(&self) -> usize {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TatModel {
        TatModel { k_lat: 2.0, pp_time: Duration::from_millis(5) }
    }

    #[test]
    fn test_tat_measurement_window_tracks_rolling_max() {
        let mut s = SuspectLeader::new(6, 1, 1, model());
        let t0 = Instant::now();
        s.mark_proof_matrix_sent(t0);
        let changed = s.mark_pre_prepare_accepted(t0 + Duration::from_millis(10));
        assert_eq!(changed, Some(Duration::from_millis(10)));

        s.mark_proof_matrix_sent(t0);
        let changed = s.mark_pre_prepare_accepted(t0 + Duration::from_millis(3));
        assert_eq!(changed, None, "smaller tat should not change the rolling max");
    }

    #[test]
    fn test_should_suspect_requires_quorum_of_reports() {
        let mut s = SuspectLeader::new(6, 1, 1, model()); // quorum_index = 2
        for (r, tat) in [(0, 100), (1, 100)] {
            s.on_tat_measure(NodeId::from(r), Duration::from_millis(tat));
        }
        assert!(s.tat_leader().is_none(), "need f+k+1=3 reports");
        s.on_tat_measure(NodeId::from(2), Duration::from_millis(100));
        assert!(s.tat_leader().is_some());
    }

    #[test]
    fn test_suspicion_is_at_most_once_per_view() {
        let mut s = SuspectLeader::new(6, 1, 1, model());
        for r in 0..3 {
            s.on_tat_measure(NodeId::from(r), Duration::from_millis(1000));
        }
        for r in 0..3 {
            s.on_tat_ub(NodeId::from(r), Duration::from_millis(10));
        }
        s.compute_tat_acceptable();
        assert!(s.should_suspect(View::FIRST));
        s.mark_suspected(View::FIRST);
        assert!(!s.should_suspect(View::FIRST));
    }

    #[test]
    fn test_equivocation_evidence_warrants_suspicion_on_first_tally() {
        let mut s = SuspectLeader::new(6, 1, 1, model());
        assert!(s.record_equivocation(View::FIRST), "first evidence should warrant a suspicion");
        assert_eq!(s.equivocation_count(View::FIRST), 1);
        s.mark_suspected(View::FIRST);
        assert!(!s.record_equivocation(View::FIRST), "view already suspected");
        assert_eq!(s.equivocation_count(View::FIRST), 2, "the tally keeps counting regardless");
    }
}
