//! Session sequence numbers.
//!
//! Each direction of a session numbers its sequenced events 1, 2, 3, ...
//! `Seq1` is the number carried by one event. `Seq0` is a count of events
//! (an ack position or the last number handed out), where 0 means none.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

/// Count of sequenced events; doubles as a cumulative ack.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq0(u64);

/// Sequence number of a single event. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq1(NonZeroU64);

impl Seq0 {
    pub const ZERO: Seq0 = Seq0::new(0);

    pub const fn new(count: u64) -> Self {
        Seq0(count)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The number the event after this count carries. Pinned at `u64::MAX`.
    pub fn next(self) -> Seq1 {
        match NonZeroU64::new(self.0.saturating_add(1)) {
            Some(n) => Seq1(n),
            None => Seq1::FIRST,
        }
    }

    /// True once `seq` is within the first `self` events.
    pub fn covers(self, seq: Seq1) -> bool {
        self.0 >= seq.get()
    }
}

impl Seq1 {
    pub const FIRST: Seq1 = Seq1(NonZeroU64::MIN);

    pub fn new(n: NonZeroU64) -> Self {
        Seq1(n)
    }

    pub fn from_u64(n: u64) -> Option<Self> {
        Some(Seq1(NonZeroU64::new(n)?))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> Seq1 {
        Seq0(self.get()).next()
    }
}

impl From<Seq1> for Seq0 {
    fn from(seq: Seq1) -> Seq0 {
        Seq0(seq.get())
    }
}

impl From<Seq0> for u64 {
    fn from(count: Seq0) -> u64 {
        count.get()
    }
}

impl From<Seq1> for u64 {
    fn from(seq: Seq1) -> u64 {
        seq.get()
    }
}

impl TryFrom<u64> for Seq1 {
    type Error = CoreError;

    fn try_from(value: u64) -> Result<Self, CoreError> {
        Seq1::from_u64(value).ok_or(CoreError::InvalidSequence {
            field: "sequence",
            value,
        })
    }
}

impl fmt::Debug for Seq0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Seq0").field(&self.0).finish()
    }
}

impl fmt::Debug for Seq1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Seq1").field(&self.get()).finish()
    }
}

impl fmt::Display for Seq0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for Seq1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.get(), f)
    }
}
