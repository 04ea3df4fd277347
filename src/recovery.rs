//! Module `recovery` implement the in-memory graph recovered from a
//! metadata log file.
//!
//! A [Recovery] value is built by replaying one log file, record by
//! record, while enforcing id-uniqueness and referential integrity. The
//! engine consumes the graph to re-instate its indexes, the rotation path
//! serializes it back into a fresh log file, see `Recovery::iterate`.
//! Once built, a graph has a single owner and is never mutated
//! concurrently.

use cbordata::Cbor;
use log::{debug, error};

use std::{collections::BTreeMap, convert::TryFrom, ffi, fs, path};

use crate::{
    record::{Key, KeyPart, Kind, Record},
    Error, Result,
};

/// Index info stored in a recovery graph. A logical slot is identified by
/// `(space_id, index_id)`, successive incarnations of the slot are told
/// apart by `index_lsn`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Index {
    /// LSN of the index creation, identifies the latest incarnation.
    pub index_lsn: i64,
    /// Ordinal index number in the space.
    pub index_id: u32,
    /// Space ID.
    pub space_id: u32,
    /// Key part definitions, as defined by the user.
    pub key_parts: Vec<KeyPart>,
    /// True if the index was dropped.
    pub is_dropped: bool,
    /// LSN of the last index dump.
    pub dump_lsn: Option<i64>,
    /// Truncate count.
    pub truncate_count: i64,
    /// Ranges of the index.
    pub ranges: Vec<i64>,
    /// All runs created for the index, both committed and not. Newer runs
    /// are closer to the head.
    pub runs: Vec<i64>,
}

/// Range info stored in a recovery graph.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Range {
    /// ID of the range.
    pub id: i64,
    /// Space ID of the owning index.
    pub space_id: u32,
    /// Ordinal number of the owning index.
    pub index_id: u32,
    /// Start of the range, `None` when open towards -inf.
    pub begin: Option<Key>,
    /// End of the range, `None` when open towards +inf.
    pub end: Option<Key>,
    /// Slices of the range, sorted by descending `dump_lsn` of the
    /// backing run, that is, newer slices are closer to the head.
    pub slices: Vec<i64>,
}

/// Run info stored in a recovery graph.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Run {
    /// ID of the run.
    pub id: i64,
    /// Space ID of the owning index.
    pub space_id: u32,
    /// Ordinal number of the owning index.
    pub index_id: u32,
    /// Max LSN stored on disk.
    pub dump_lsn: Option<i64>,
    /// For dropped runs, signature of the last checkpoint using the run.
    pub gc_lsn: Option<i64>,
    /// True if the run was never committed, prepared but not created.
    pub is_incomplete: bool,
    /// True if the run was dropped.
    pub is_dropped: bool,
}

/// Slice info stored in a recovery graph.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Slice {
    /// ID of the slice.
    pub id: i64,
    /// Run this slice was created for.
    pub run_id: i64,
    /// Range this slice belongs to.
    pub range_id: i64,
    /// Start of the slice, `None` when open towards -inf.
    pub begin: Option<Key>,
    /// End of the slice, `None` when open towards +inf.
    pub end: Option<Key>,
}

/// Recovery graph, the set of live LSM objects reconstructed by replaying
/// one metadata log file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Recovery {
    // (space_id, index_id) -> the slot's current incarnation.
    indexes: BTreeMap<(u32, u32), Index>,
    // every incarnation lsn ever seen -> slot. Lookups through an old lsn
    // alias to the slot's current incarnation.
    index_lsns: BTreeMap<i64, (u32, u32)>,
    ranges: BTreeMap<i64, Range>,
    runs: BTreeMap<i64, Run>,
    slices: BTreeMap<i64, Slice>,
    // maximal object id observed, -1 when no object was recovered.
    max_id: i64,
}

impl Default for Recovery {
    fn default() -> Recovery {
        Recovery::new()
    }
}

fn req<T>(val: Option<T>, name: &str) -> Result<T> {
    match val {
        Some(val) => Ok(val),
        None => err_at!(InvalidLog, msg: "missing {}", name),
    }
}

impl Recovery {
    pub fn new() -> Recovery {
        Recovery {
            indexes: BTreeMap::new(),
            index_lsns: BTreeMap::new(),
            ranges: BTreeMap::new(),
            runs: BTreeMap::new(),
            slices: BTreeMap::new(),
            max_id: -1,
        }
    }

    /// Build a recovery graph by replaying the log file at `path`. A
    /// missing file is an empty graph, normal for fresh installs since
    /// log files materialize on the first append. If `only_checkpoint` is
    /// true replay stops at the first `Snapshot` marker, yielding a
    /// consistent view of the LSM at the time of the checkpoint.
    pub fn load(path: &ffi::OsStr, only_checkpoint: bool) -> Result<Recovery> {
        let mut recovery = Recovery::new();
        if !path::Path::new(path).exists() {
            return Ok(recovery);
        }

        debug!(target: "vylog", "loading log file {:?}", path);

        let mut file = {
            let mut opts = fs::OpenOptions::new();
            err_at!(IOError, opts.read(true).open(path), "opening log {:?}", path)?
        };
        let len = err_at!(IOError, file.metadata())?.len();
        let mut fpos = 0_u64;
        while fpos < len {
            let (value, n) = match Cbor::decode(&mut file) {
                Ok(val) => val,
                Err(err) => return err_at!(InvalidLog, msg: "bad row: {}", err),
            };
            fpos += err_at!(FailConvert, u64::try_from(n))?;
            let record = Record::from_row(value)?;
            if let Kind::Snapshot = record.to_kind() {
                if only_checkpoint {
                    break;
                }
                continue;
            }
            recovery.apply(&record)?;
        }

        debug!(target: "vylog", "done loading log file {:?}", path);
        Ok(recovery)
    }

    /// Apply a single record to the graph. The first invariant violation
    /// aborts replay, the error carries a dump of the offending record.
    pub fn apply(&mut self, record: &Record) -> Result<()> {
        let res = match record.to_kind() {
            Kind::CreateIndex => self.apply_create_index(record),
            Kind::DropIndex => self.apply_drop_index(record),
            Kind::InsertRange => self.apply_insert_range(record),
            Kind::DeleteRange => self.apply_delete_range(record),
            Kind::PrepareRun => self.apply_prepare_run(record),
            Kind::CreateRun => self.apply_create_run(record),
            Kind::DropRun => self.apply_drop_run(record),
            Kind::ForgetRun => self.apply_forget_run(record),
            Kind::InsertSlice => self.apply_insert_slice(record),
            Kind::DeleteSlice => self.apply_delete_slice(record),
            Kind::DumpIndex => self.apply_dump_index(record),
            Kind::TruncateIndex => self.apply_truncate_index(record),
            Kind::Snapshot => err_at!(Fatal, msg: "snapshot marker in replay"),
        };
        match res {
            Ok(()) => {
                for id in
                    [record.range_id, record.run_id, record.slice_id].iter().flatten()
                {
                    if *id > self.max_id {
                        self.max_id = *id;
                    }
                }
                Ok(())
            }
            Err(Error::InvalidLog(prefix, msg)) => {
                error!(target: "vylog", "failed to apply record {}", record);
                Err(Error::InvalidLog(prefix, format!("{}, in {}", msg, record)))
            }
            Err(err) => Err(err),
        }
    }

    fn apply_create_index(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let space_id = req(record.space_id, "space_id")?;
        let index_id = req(record.index_id, "index_id")?;
        let key_parts = match &record.key_parts {
            Some(parts) => parts.clone(),
            None => {
                return err_at!(
                    InvalidLog, msg: "missing key definition for index {}", index_lsn
                )
            }
        };

        if self.index_lsns.contains_key(&index_lsn) {
            return err_at!(InvalidLog, msg: "duplicate index id {}", index_lsn);
        }

        let slot = (space_id, index_id);
        match self.indexes.get_mut(&slot) {
            Some(index) if !index.is_dropped => {
                return err_at!(
                    InvalidLog, msg: "index {}/{} created twice", space_id, index_id
                )
            }
            Some(index) => {
                // the slot was dropped and is re-created, update the key
                // definition and reset incarnation state. Ranges and runs
                // stay, dropped runs are still tracked for GC.
                index.index_lsn = index_lsn;
                index.key_parts = key_parts;
                index.is_dropped = false;
                index.dump_lsn = None;
                index.truncate_count = 0;
            }
            None => {
                let index = Index {
                    index_lsn,
                    index_id,
                    space_id,
                    key_parts,
                    is_dropped: false,
                    dump_lsn: None,
                    truncate_count: 0,
                    ranges: vec![],
                    runs: vec![],
                };
                self.indexes.insert(slot, index);
            }
        }
        self.index_lsns.insert(index_lsn, slot);
        Ok(())
    }

    fn apply_drop_index(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let slot = match self.index_lsns.get(&index_lsn) {
            Some(slot) => *slot,
            None => {
                return err_at!(
                    InvalidLog, msg: "index {} deleted but not registered", index_lsn
                )
            }
        };
        {
            let index = &self.indexes[&slot];
            if index.is_dropped {
                return err_at!(InvalidLog, msg: "index {} deleted twice", index_lsn);
            }
            if !index.ranges.is_empty() {
                return err_at!(
                    InvalidLog, msg: "dropped index {} has ranges", index_lsn
                );
            }
            for run_id in index.runs.iter() {
                let run = &self.runs[run_id];
                if !run.is_dropped && !run.is_incomplete {
                    return err_at!(
                        InvalidLog, msg: "dropped index {} has active runs", index_lsn
                    );
                }
            }
        }
        self.indexes.get_mut(&slot).unwrap().is_dropped = true;
        Ok(())
    }

    fn apply_insert_range(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let range_id = req(record.range_id, "range_id")?;
        if self.ranges.contains_key(&range_id) {
            return err_at!(InvalidLog, msg: "duplicate range id {}", range_id);
        }
        let slot = match self.index_lsns.get(&index_lsn) {
            Some(slot) => *slot,
            None => {
                return err_at!(
                    InvalidLog,
                    msg: "range {} created for unregistered index {}", range_id, index_lsn
                )
            }
        };
        let range = Range {
            id: range_id,
            space_id: slot.0,
            index_id: slot.1,
            begin: record.begin.clone(),
            end: record.end.clone(),
            slices: vec![],
        };
        self.ranges.insert(range_id, range);
        self.indexes.get_mut(&slot).unwrap().ranges.push(range_id);
        Ok(())
    }

    fn apply_delete_range(&mut self, record: &Record) -> Result<()> {
        let range_id = req(record.range_id, "range_id")?;
        let slot = match self.ranges.get(&range_id) {
            Some(range) if !range.slices.is_empty() => {
                return err_at!(
                    InvalidLog, msg: "deleted range {} has run slices", range_id
                )
            }
            Some(range) => (range.space_id, range.index_id),
            None => {
                return err_at!(
                    InvalidLog, msg: "range {} deleted but not registered", range_id
                )
            }
        };
        self.ranges.remove(&range_id);
        self.indexes.get_mut(&slot).unwrap().ranges.retain(|id| *id != range_id);
        Ok(())
    }

    fn apply_prepare_run(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let run_id = req(record.run_id, "run_id")?;
        let slot = match self.index_lsns.get(&index_lsn) {
            Some(slot) => *slot,
            None => {
                return err_at!(
                    InvalidLog,
                    msg: "run {} created for unregistered index {}", run_id, index_lsn
                )
            }
        };
        if self.runs.contains_key(&run_id) {
            return err_at!(InvalidLog, msg: "duplicate run id {}", run_id);
        }
        let run = Run {
            id: run_id,
            space_id: slot.0,
            index_id: slot.1,
            dump_lsn: None,
            gc_lsn: None,
            is_incomplete: true,
            is_dropped: false,
        };
        self.runs.insert(run_id, run);
        self.indexes.get_mut(&slot).unwrap().runs.insert(0, run_id);
        Ok(())
    }

    fn apply_create_run(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let run_id = req(record.run_id, "run_id")?;
        let dump_lsn = req(record.dump_lsn, "dump_lsn")?;
        let slot = match self.index_lsns.get(&index_lsn) {
            Some(slot) => *slot,
            None => {
                return err_at!(
                    InvalidLog,
                    msg: "run {} created for unregistered index {}", run_id, index_lsn
                )
            }
        };
        if self.indexes[&slot].is_dropped {
            return err_at!(
                InvalidLog, msg: "run {} created for deleted index {}", run_id, index_lsn
            );
        }
        let old_slot = match self.runs.get(&run_id) {
            Some(run) if run.is_dropped => {
                return err_at!(
                    InvalidLog, msg: "run {} committed after deletion", run_id
                )
            }
            Some(run) => Some((run.space_id, run.index_id)),
            None => None,
        };
        match old_slot {
            Some(old_slot) => {
                let run = self.runs.get_mut(&run_id).unwrap();
                run.dump_lsn = Some(dump_lsn);
                run.is_incomplete = false;
                run.space_id = slot.0;
                run.index_id = slot.1;
                self.indexes
                    .get_mut(&old_slot)
                    .unwrap()
                    .runs
                    .retain(|id| *id != run_id);
            }
            None => {
                let run = Run {
                    id: run_id,
                    space_id: slot.0,
                    index_id: slot.1,
                    dump_lsn: Some(dump_lsn),
                    gc_lsn: None,
                    is_incomplete: false,
                    is_dropped: false,
                };
                self.runs.insert(run_id, run);
            }
        }
        // the record wins, the run moves to the head of the list.
        self.indexes.get_mut(&slot).unwrap().runs.insert(0, run_id);
        Ok(())
    }

    fn apply_drop_run(&mut self, record: &Record) -> Result<()> {
        let run_id = req(record.run_id, "run_id")?;
        let gc_lsn = req(record.gc_lsn, "gc_lsn")?;
        match self.runs.get_mut(&run_id) {
            Some(run) if run.is_dropped => {
                err_at!(InvalidLog, msg: "run {} deleted twice", run_id)
            }
            Some(run) => {
                run.is_dropped = true;
                run.gc_lsn = Some(gc_lsn);
                Ok(())
            }
            None => {
                err_at!(InvalidLog, msg: "run {} deleted but not registered", run_id)
            }
        }
    }

    fn apply_forget_run(&mut self, record: &Record) -> Result<()> {
        let run_id = req(record.run_id, "run_id")?;
        let slot = match self.runs.get(&run_id) {
            Some(run) => (run.space_id, run.index_id),
            None => {
                return err_at!(
                    InvalidLog, msg: "run {} forgotten but not registered", run_id
                )
            }
        };
        self.runs.remove(&run_id);
        self.indexes.get_mut(&slot).unwrap().runs.retain(|id| *id != run_id);
        Ok(())
    }

    fn apply_insert_slice(&mut self, record: &Record) -> Result<()> {
        let range_id = req(record.range_id, "range_id")?;
        let run_id = req(record.run_id, "run_id")?;
        let slice_id = req(record.slice_id, "slice_id")?;
        if self.slices.contains_key(&slice_id) {
            return err_at!(InvalidLog, msg: "duplicate slice id {}", slice_id);
        }
        if !self.ranges.contains_key(&range_id) {
            return err_at!(
                InvalidLog,
                msg: "slice {} created for unregistered range {}", slice_id, range_id
            );
        }
        let dump_lsn = match self.runs.get(&run_id) {
            Some(run) => run.dump_lsn.unwrap_or(-1),
            None => {
                return err_at!(
                    InvalidLog,
                    msg: "slice {} created for unregistered run {}", slice_id, run_id
                )
            }
        };
        let slice = Slice {
            id: slice_id,
            run_id,
            range_id,
            begin: record.begin.clone(),
            end: record.end.clone(),
        };
        // If dump races with compaction, an older slice created by
        // compaction may be added after a newer slice created by dump.
        // Make sure that the list stays sorted by LSN in any case.
        let pos = {
            let range = &self.ranges[&range_id];
            range.slices.iter().position(|id| {
                let run = &self.runs[&self.slices[id].run_id];
                run.dump_lsn.unwrap_or(-1) < dump_lsn
            })
        };
        self.slices.insert(slice_id, slice);
        let range = self.ranges.get_mut(&range_id).unwrap();
        match pos {
            Some(pos) => range.slices.insert(pos, slice_id),
            None => range.slices.push(slice_id),
        }
        Ok(())
    }

    fn apply_delete_slice(&mut self, record: &Record) -> Result<()> {
        let slice_id = req(record.slice_id, "slice_id")?;
        let range_id = match self.slices.get(&slice_id) {
            Some(slice) => slice.range_id,
            None => {
                return err_at!(
                    InvalidLog, msg: "slice {} deleted but not registered", slice_id
                )
            }
        };
        self.slices.remove(&slice_id);
        let range = self.ranges.get_mut(&range_id).unwrap();
        range.slices.retain(|id| *id != slice_id);
        Ok(())
    }

    fn apply_dump_index(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let dump_lsn = req(record.dump_lsn, "dump_lsn")?;
        match self.index_by_lsn_mut(index_lsn) {
            Some(index) if index.is_dropped => {
                err_at!(InvalidLog, msg: "dump of deleted index {}", index_lsn)
            }
            Some(index) => {
                index.dump_lsn = Some(dump_lsn);
                Ok(())
            }
            None => {
                err_at!(InvalidLog, msg: "dump of unregistered index {}", index_lsn)
            }
        }
    }

    fn apply_truncate_index(&mut self, record: &Record) -> Result<()> {
        let index_lsn = req(record.index_lsn, "index_lsn")?;
        let truncate_count = req(record.truncate_count, "truncate_count")?;
        match self.index_by_lsn_mut(index_lsn) {
            Some(index) if index.is_dropped => {
                err_at!(InvalidLog, msg: "truncation of deleted index {}", index_lsn)
            }
            Some(index) => {
                index.truncate_count = truncate_count;
                Ok(())
            }
            None => {
                err_at!(InvalidLog, msg: "truncation of unregistered index {}", index_lsn)
            }
        }
    }

    fn index_by_lsn_mut(&mut self, index_lsn: i64) -> Option<&mut Index> {
        let slot = *self.index_lsns.get(&index_lsn)?;
        self.indexes.get_mut(&slot)
    }
}

impl Recovery {
    /// Serialize the graph as a stream of records. Replaying the stream
    /// reconstructs the graph, modulo dropped indexes without remaining
    /// runs, which are obsolete for recovery and GC alike and hence
    /// purged. This is the compaction effect of log rotation.
    pub fn iterate<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        for index in self.indexes.values() {
            if index.is_dropped && index.runs.is_empty() {
                continue;
            }
            self.iterate_index(index, &mut cb)?
        }
        Ok(())
    }

    /// Replay the records of a single index slot through `cb`.
    ///
    /// If the caller asks for an `index_lsn` older than the recorded
    /// incarnation, a synthetic create/drop pair is emitted, the
    /// incarnation is going to be dropped by a replayed statement and
    /// does not need recovering. If newer, nothing is emitted and the
    /// caller shall re-log the index. Under checkpoint recovery the
    /// recorded incarnation is replayed in full.
    pub fn load_index<F>(
        &self,
        space_id: u32,
        index_id: u32,
        index_lsn: i64,
        is_checkpoint_recovery: bool,
        mut cb: F,
    ) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        let index = match self.indexes.get(&(space_id, index_id)) {
            Some(index) => index,
            None => return Ok(()),
        };
        if index_lsn < index.index_lsn {
            let record = {
                let mut record =
                    Record::create_index(index.space_id, index.index_id, index_lsn, vec![]);
                record.key_parts = None;
                record
            };
            cb(&record)?;
            cb(&Record::drop_index(index_lsn))?;
            Ok(())
        } else if is_checkpoint_recovery || index_lsn == index.index_lsn {
            self.iterate_index(index, &mut cb)
        } else {
            Ok(())
        }
    }

    fn iterate_index<F>(&self, index: &Index, cb: &mut F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        cb(&Record::create_index(
            index.space_id,
            index.index_id,
            index.index_lsn,
            index.key_parts.clone(),
        ))?;
        if index.truncate_count > 0 {
            cb(&Record::truncate_index(index.index_lsn, index.truncate_count))?
        }
        if let Some(dump_lsn) = index.dump_lsn {
            cb(&Record::dump_index(index.index_lsn, dump_lsn))?
        }
        for run_id in index.runs.iter() {
            let run = &self.runs[run_id];
            let record = match (run.is_incomplete, run.dump_lsn) {
                (false, Some(dump_lsn)) => {
                    Record::create_run(index.index_lsn, run.id, dump_lsn)
                }
                (_, _) => Record::prepare_run(index.index_lsn, run.id),
            };
            cb(&record)?;
            if let (true, Some(gc_lsn)) = (run.is_dropped, run.gc_lsn) {
                cb(&Record::drop_run(run.id, gc_lsn))?
            }
        }
        for range_id in index.ranges.iter() {
            let range = &self.ranges[range_id];
            cb(&Record::insert_range(
                index.index_lsn,
                range.id,
                range.begin.clone(),
                range.end.clone(),
            ))?;
            // newer slices are stored closer to the head of the list,
            // emit in chronological order, oldest first.
            for slice_id in range.slices.iter().rev() {
                let slice = &self.slices[slice_id];
                cb(&Record::insert_slice(
                    range.id,
                    slice.run_id,
                    slice.id,
                    slice.begin.clone(),
                    slice.end.clone(),
                ))?
            }
        }
        if index.is_dropped {
            cb(&Record::drop_index(index.index_lsn))?
        }
        Ok(())
    }
}

impl Recovery {
    /// Look up the current incarnation of an index slot.
    pub fn lookup_index(&self, space_id: u32, index_id: u32) -> Option<&Index> {
        self.indexes.get(&(space_id, index_id))
    }

    /// Look up a range by id.
    pub fn lookup_range(&self, range_id: i64) -> Option<&Range> {
        self.ranges.get(&range_id)
    }

    /// Look up a run by id.
    pub fn lookup_run(&self, run_id: i64) -> Option<&Run> {
        self.runs.get(&run_id)
    }

    /// Look up a slice by id.
    pub fn lookup_slice(&self, slice_id: i64) -> Option<&Slice> {
        self.slices.get(&slice_id)
    }

    /// Return the maximal object id observed, -1 when no object was
    /// recovered.
    pub fn to_max_id(&self) -> i64 {
        self.max_id
    }

    /// Return true when the graph holds no objects at all.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
            && self.ranges.is_empty()
            && self.runs.is_empty()
            && self.slices.is_empty()
    }
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod recovery_test;
