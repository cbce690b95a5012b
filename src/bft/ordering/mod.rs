//! Sequence numbering shared by the consensus, checkpoint and view-change
//! sub-protocols.

use std::cmp::Ordering;
use std::fmt;

use either::{Either, Left, Right};

use crate::bft::message_log;

use serde::{Deserialize, Serialize};

/// Represents a sequence number attributed to a client request
/// during a `Consensus` instance, or to a view during view-change.
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SeqNo(i32);

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
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

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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

/// Implemented by anything stamped with a sequence number, so log and
/// checkpoint code can sort and compare heterogeneous entries uniformly.
pub trait Orderable {
    fn sequence_number(&self) -> SeqNo;
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        let (next, overflow) = (self.0).overflowing_add(1);
        SeqNo(if overflow { 0 } else { next })
    }

    /// Returns an appropriate value to index a `TboQueue`, relative to
    /// `other`, bounding how far out-of-order a message may be buffered.
    #[inline]
    pub(crate) fn index(self, other: SeqNo) -> Either<InvalidSeqNo, usize> {
        const OVERFLOW_THRES_POS: i32 = 10000;
        const OVERFLOW_THRES_NEG: i32 = -OVERFLOW_THRES_POS;
        const DROP_SEQNO_THRES: i32 = (message_log::PERIOD + (message_log::PERIOD >> 1)) as i32;

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_wraps_on_overflow() {
        let near_max = SeqNo(i32::MAX);
        assert_eq!(near_max.next(), SeqNo(0));
    }

    #[test]
    fn ordering_tracks_distance() {
        let a = SeqNo::from(10u32);
        let b = SeqNo::from(12u32);
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a, SeqNo::from(10u32));
    }
}
