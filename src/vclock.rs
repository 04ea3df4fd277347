use std::{collections::BTreeMap, fmt, result};

/// Checkpoint vector-clock of the outer database.
///
/// A map of replica-id to the replica's LSN. Vylog treats the clock as an
/// opaque, monotonically advancing timestamp, only its component sum, called
/// the `signature`, is interpreted, since log files are named after it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Vclock(BTreeMap<u32, i64>);

impl fmt::Display for Vclock {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let parts: Vec<String> =
            self.0.iter().map(|(id, lsn)| format!("{}: {}", id, lsn)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl Vclock {
    /// Create an empty clock, its signature is ZERO.
    pub fn new() -> Vclock {
        Vclock(BTreeMap::new())
    }

    /// Advance the component for `replica` to `lsn`. Components only move
    /// forward, regressions are ignored.
    pub fn follow(&mut self, replica: u32, lsn: i64) -> &mut Self {
        let entry = self.0.entry(replica).or_insert(0);
        if lsn > *entry {
            *entry = lsn;
        }
        self
    }

    /// Return the signature, the sum of all components.
    pub fn to_signature(&self) -> i64 {
        self.0.values().sum()
    }
}

#[cfg(test)]
#[path = "vclock_test.rs"]
mod vclock_test;
