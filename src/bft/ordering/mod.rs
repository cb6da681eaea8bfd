//! Identity and sequencing primitives shared by every sub-protocol:
//! `SeqNo` (both the per-consensus-instance id and the global ordinal
//! `OrdSeq`), `View`, `Incarnation`, `GlobalConfigNumber` and
//! `PoSeqPair`.

use std::cmp::{Ordering, PartialEq, PartialOrd};

use either::{Either, Left, Right};

use crate::bft::log;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Implemented by types that carry a `SeqNo`.
pub trait Orderable {
    /// Returns the sequence number of this object.
    fn sequence_number(&self) -> SeqNo;
}

/// Represents a sequence number attributed to a client request
/// during a `Consensus` instance, or equivalently, the global
/// ordinal index `OrdSeq` of an executed slot.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct SeqNo(i32);

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

impl SeqNo {
    /// The first valid sequence number.
    pub const ZERO: SeqNo = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        let (next, overflow) = (self.0).overflowing_add(1);
        SeqNo(if overflow { 0 } else { next })
    }

    /// Return an appropriate value to index a time-bound-ordering queue.
    #[inline]
    pub(crate) fn index(self, other: SeqNo) -> Either<InvalidSeqNo, usize> {
        const OVERFLOW_THRES_POS: i32 = 10000;
        const OVERFLOW_THRES_NEG: i32 = -OVERFLOW_THRES_POS;
        const DROP_SEQNO_THRES: i32 = (log::CATCHUP_HISTORY + (log::CATCHUP_HISTORY >> 1)) as i32;

        let index = {
            let index = (self.0).wrapping_sub(other.0);
            if index < OVERFLOW_THRES_NEG || index > OVERFLOW_THRES_POS {
                i32::MAX.wrapping_add(index).wrapping_add(1)
            } else {
                index
            }
        };

        if index < 0 || index > DROP_SEQNO_THRES {
            Left(if index < 0 {
                InvalidSeqNo::Small
            } else {
                InvalidSeqNo::Big
            })
        } else {
            Right(index as usize)
        }
    }
}

impl From<u32> for SeqNo {
    #[inline]
    fn from(sequence_number: u32) -> SeqNo {
        SeqNo(sequence_number as i32)
    }
}

impl From<SeqNo> for u32 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u32 {
        sequence_number.0 as u32
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &SeqNo) -> Option<Ordering> {
        Some(match self.index(*other) {
            Right(0) => Ordering::Equal,
            Left(InvalidSeqNo::Small) => Ordering::Less,
            _ => Ordering::Greater,
        })
    }
}

/// A view identifies the current leader in the Global-Order layer.
///
/// `View`s are monotonically increasing within a system incarnation;
/// the leader of a view is `((view - 1) mod n) + 1`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, PartialOrd, Hash)]
pub struct View(u32);

impl View {
    /// The first view of a system incarnation.
    pub const FIRST: View = View(1);

    /// Returns the following view.
    #[inline]
    pub fn next(self) -> View {
        View(self.0 + 1)
    }

    /// Returns the 0-indexed replica id that leads this view, among
    /// `n` replicas.
    #[inline]
    pub fn leader_index(self, n: u32) -> u32 {
        (self.0 - 1) % n
    }
}

impl From<u32> for View {
    #[inline]
    fn from(view: u32) -> View {
        View(view.max(1))
    }
}

impl From<View> for u32 {
    #[inline]
    fn from(view: View) -> u32 {
        view.0
    }
}

/// A per-replica session epoch, rolled on restart, strictly
/// non-decreasing across recoveries.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, PartialOrd, Hash, Default)]
pub struct Incarnation(u64);

impl Incarnation {
    /// The incarnation used before any recovery has taken place.
    pub const ZERO: Incarnation = Incarnation(0);

    /// Returns the following incarnation.
    pub fn next(self) -> Incarnation {
        Incarnation(self.0 + 1)
    }
}

impl From<u64> for Incarnation {
    fn from(value: u64) -> Self {
        Incarnation(value)
    }
}

impl From<Incarnation> for u64 {
    fn from(value: Incarnation) -> Self {
        value.0
    }
}

/// A system-wide membership epoch, monotonic, rolled on a full
/// system reset or membership reconfiguration.
///
/// Per REDESIGN FLAGS, this is backed by a strictly increasing
/// counter rather than a wall-clock timestamp -- see `DESIGN.md`
/// for the rationale (spec Open Question (c)).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, PartialOrd, Hash, Default)]
pub struct GlobalConfigNumber(u64);

impl GlobalConfigNumber {
    /// The config number used before any reset has taken place.
    pub const ZERO: GlobalConfigNumber = GlobalConfigNumber(0);

    /// Returns the following global configuration number.
    pub fn next(self) -> GlobalConfigNumber {
        GlobalConfigNumber(self.0 + 1)
    }
}

impl From<u64> for GlobalConfigNumber {
    fn from(value: u64) -> Self {
        GlobalConfigNumber(value)
    }
}

/// A per-originator Pre-Order sequence pair: `(incarnation, seq_num)`,
/// totally ordered lexicographically.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PoSeqPair {
    incarnation: Incarnation,
    seq_num: SeqNo,
}

impl PoSeqPair {
    /// Creates a new `PoSeqPair`.
    pub fn new(incarnation: Incarnation, seq_num: SeqNo) -> Self {
        Self { incarnation, seq_num }
    }

    /// Returns the incarnation half of this pair.
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// Returns the sequence-number half of this pair.
    pub fn seq_num(&self) -> SeqNo {
        self.seq_num
    }
}

impl Ord for PoSeqPair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.incarnation
            .cmp(&other.incarnation)
            .then_with(|| self.seq_num.partial_cmp(&other.seq_num).unwrap_or(Ordering::Equal))
    }
}

impl PartialOrd for PoSeqPair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqno_ordering() {
        let a = SeqNo::from(5u32);
        let b = SeqNo::from(6u32);
        assert!(a < b);
        assert_eq!(a.next(), b);
    }

    #[test]
    fn test_view_leader_rotation() {
        let v1 = View::from(1u32);
        let v2 = v1.next();
        assert_eq!(v1.leader_index(4), 0);
        assert_eq!(v2.leader_index(4), 1);
    }

    #[test]
    fn test_po_seq_pair_lexicographic() {
        let a = PoSeqPair::new(Incarnation::from(1u64), SeqNo::from(100u32));
        let b = PoSeqPair::new(Incarnation::from(2u64), SeqNo::from(0u32));
        assert!(a < b, "a higher incarnation always wins regardless of seq_num");
    }
}
