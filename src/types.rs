//! Core data model: entries, clock values, and the clocked entries that the
//! replication layer moves between nodes.
use serde::{Deserialize, Serialize};

/// An application-visible key-value pair. Both fields are opaque; keys are
/// UTF-8 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A logical timestamp issued by the clock server.
///
/// Clock values are totally ordered lexicographically: the epoch majors and
/// the counter minors, which is exactly what the derived `Ord` yields given
/// the field order. The epoch is persistent and strictly increases on every
/// clock-server restart; the counter resets to 1, so any value issued after
/// a restart dominates every value issued before it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ClockValue {
    pub epoch: u64,
    pub counter: u64,
}

impl ClockValue {
    pub fn new(epoch: u64, counter: u64) -> Self {
        Self { epoch, counter }
    }
}

impl std::fmt::Display for ClockValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch, self.counter)
    }
}

/// An entry together with the clock value under which it was written.
///
/// This is the unit of replication: a node holds at most one clocked entry
/// per key, and readers resolve divergent replicas by taking the entry with
/// the greatest clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockedEntry {
    pub entry: Entry,
    pub clock: ClockValue,
}

impl ClockedEntry {
    pub fn new(entry: Entry, clock: ClockValue) -> Self {
        Self { entry, clock }
    }
}
