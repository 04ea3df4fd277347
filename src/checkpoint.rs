use std::collections::BTreeMap;

use crate::vclock::Vclock;

/// Ordered set of checkpoint vector-clocks known to the log, keyed by
/// signature. Each entry corresponds to exactly one log file, though the
/// file itself materializes lazily, on the first append after the
/// checkpoint was taken.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSet {
    checkpoints: BTreeMap<i64, Vclock>,
}

impl CheckpointSet {
    pub fn new() -> CheckpointSet {
        CheckpointSet { checkpoints: BTreeMap::new() }
    }

    /// Register a checkpoint. Re-registering the same signature is a no-op.
    pub fn add(&mut self, vclock: Vclock) {
        self.checkpoints.entry(vclock.to_signature()).or_insert(vclock);
    }

    /// Register a checkpoint scanned from a log file on disk. Only the
    /// signature survives in a file name, so the clock is reconstructed
    /// with the sum in a single component.
    pub fn add_signature(&mut self, signature: i64) {
        let mut vclock = Vclock::new();
        vclock.follow(0, signature);
        self.add(vclock);
    }

    /// Return the signature of the latest checkpoint.
    pub fn last_signature(&self) -> Option<i64> {
        self.checkpoints.keys().next_back().copied()
    }

    /// Return the signature of the checkpoint taken before `signature`.
    pub fn prev_signature(&self, signature: i64) -> Option<i64> {
        self.checkpoints.range(..signature).next_back().map(|(s, _)| *s)
    }

    /// Forget checkpoints with signature strictly less than `signature`,
    /// return the forgotten signatures.
    pub fn remove_below(&mut self, signature: i64) -> Vec<i64> {
        let removed: Vec<i64> =
            self.checkpoints.range(..signature).map(|(s, _)| *s).collect();
        for signature in removed.iter() {
            self.checkpoints.remove(signature);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
#[path = "checkpoint_test.rs"]
mod checkpoint_test;
