//! Record model for the metadata log.
//!
//! Every structural change to the LSM forest is one [Record], a kind
//! discriminant and a sparse set of fields. On the wire a record is a
//! two-part row, the kind code followed by a tag-keyed field map, where
//! only present fields are transmitted. Field tags and kind codes are
//! stable across versions and append-only.

use arbitrary::{Arbitrary, Unstructured};
use cbordata::{Cbor, Cborize, FromCbor, IntoCbor};

use std::{
    convert::TryFrom,
    fmt, result,
};

use crate::{Error, Result};

/// This value must change only when the shape of the row type changes.
/// High 16-bits identify the type and lower 16-bits identify the version.
const ROW_VER: u32 = 0x00010001;
const FIELD_VER: u32 = 0x00020001;
const DATUM_VER: u32 = 0x00030001;
const KEY_PART_VER: u32 = 0x00040001;

// Integer key of a field in the row's field map.
const KEY_INDEX_LSN: u64 = 0;
const KEY_RANGE_ID: u64 = 1;
const KEY_RUN_ID: u64 = 2;
const KEY_BEGIN: u64 = 3;
const KEY_END: u64 = 4;
const KEY_INDEX_ID: u64 = 5;
const KEY_SPACE_ID: u64 = 6;
const KEY_DEF: u64 = 7;
const KEY_SLICE_ID: u64 = 8;
const KEY_DUMP_LSN: u64 = 9;
const KEY_GC_LSN: u64 = 10;
const KEY_TRUNCATE_COUNT: u64 = 11;

/// Field types allowed in a key-part definition.
pub const KEY_PART_TYPES: [&str; 5] = ["unsigned", "integer", "string", "binary", "boolean"];

/// Kind of a metadata log record. Wire codes are append-only, which is
/// why `TruncateIndex`, a later addition, sorts after `Snapshot`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    /// Declare an index incarnation.
    CreateIndex = 0,
    /// Mark the incarnation dropped.
    DropIndex = 1,
    /// Add a range spanning `[begin, end)` to an index.
    InsertRange = 2,
    /// Remove a range, no live slices allowed.
    DeleteRange = 3,
    /// Reserve a run id for a file not yet committed.
    PrepareRun = 4,
    /// Confirm the run file exists.
    CreateRun = 5,
    /// Mark the run unused by the LSM, still needed by checkpoints whose
    /// signature is less than or equal to the record's `gc_lsn`.
    DropRun = 6,
    /// Release the run entirely, its files may be deleted.
    ForgetRun = 7,
    /// Bind a run, possibly trimmed to `[begin, end)`, into a range.
    InsertSlice = 8,
    /// Unbind a slice.
    DeleteSlice = 9,
    /// Record progress of the latest dump for an index.
    DumpIndex = 10,
    /// End-of-snapshot marker, separates replayed history from live
    /// additions within a file.
    Snapshot = 11,
    /// Monotone truncation counter.
    TruncateIndex = 12,
}

impl TryFrom<u64> for Kind {
    type Error = Error;

    fn try_from(code: u64) -> Result<Kind> {
        let kind = match code {
            0 => Kind::CreateIndex,
            1 => Kind::DropIndex,
            2 => Kind::InsertRange,
            3 => Kind::DeleteRange,
            4 => Kind::PrepareRun,
            5 => Kind::CreateRun,
            6 => Kind::DropRun,
            7 => Kind::ForgetRun,
            8 => Kind::InsertSlice,
            9 => Kind::DeleteSlice,
            10 => Kind::DumpIndex,
            11 => Kind::Snapshot,
            12 => Kind::TruncateIndex,
            code => return err_at!(InvalidLog, msg: "bad record: unknown kind {}", code),
        };
        Ok(kind)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let name = match self {
            Kind::CreateIndex => "create_index",
            Kind::DropIndex => "drop_index",
            Kind::InsertRange => "insert_range",
            Kind::DeleteRange => "delete_range",
            Kind::PrepareRun => "prepare_run",
            Kind::CreateRun => "create_run",
            Kind::DropRun => "drop_run",
            Kind::ForgetRun => "forget_run",
            Kind::InsertSlice => "insert_slice",
            Kind::DeleteSlice => "delete_slice",
            Kind::DumpIndex => "dump_index",
            Kind::Snapshot => "snapshot",
            Kind::TruncateIndex => "truncate_index",
        };
        write!(f, "{}", name)
    }
}

/// Single element of a key tuple.
#[derive(Debug, Clone, Eq, PartialEq, Cborize)]
pub enum Datum {
    Unsigned(u64),
    Integer(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Datum {
    const ID: u32 = DATUM_VER;
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            Datum::Unsigned(val) => write!(f, "{}", val),
            Datum::Integer(val) => write!(f, "{}", val),
            Datum::Str(val) => write!(f, "{:?}", val),
            Datum::Bytes(val) => write!(f, "b{:?}", val),
        }
    }
}

/// Typed lexicographic key tuple, bound of a range or a slice. An open
/// bound is the absence of a key, never a sentinel value.
pub type Key = Vec<Datum>;

/// Key-part definition of an index, as defined by the user.
#[derive(Debug, Clone, Eq, PartialEq, Cborize)]
pub struct KeyPart {
    pub field_no: u32,
    pub field_type: String,
    pub is_nullable: bool,
}

impl KeyPart {
    const ID: u32 = KEY_PART_VER;

    pub fn new(field_no: u32, field_type: &str, is_nullable: bool) -> KeyPart {
        KeyPart {
            field_no,
            field_type: field_type.to_string(),
            is_nullable,
        }
    }

    fn validate(&self) -> Result<()> {
        if KEY_PART_TYPES.contains(&self.field_type.as_str()) {
            Ok(())
        } else {
            err_at!(
                InvalidLog, msg: "bad record: key-part field type {:?}", self.field_type
            )
        }
    }
}

impl<'a> Arbitrary<'a> for KeyPart {
    fn arbitrary(u: &mut Unstructured) -> arbitrary::Result<Self> {
        let field_type = *u.choose(&KEY_PART_TYPES)?;
        Ok(KeyPart {
            field_no: u.arbitrary::<u32>()? % 32,
            field_type: field_type.to_string(),
            is_nullable: u.arbitrary()?,
        })
    }
}

// Value in the row's field map, variant per family of field.
#[derive(Debug, Clone, Eq, PartialEq, Cborize)]
enum Value {
    Int(i64),
    Key(Vec<Datum>),
    Parts(Vec<KeyPart>),
}

impl Value {
    const ID: u32 = FIELD_VER;
}

// One field in the row's field map.
#[derive(Debug, Clone, Eq, PartialEq, Cborize)]
struct Field {
    tag: u64,
    value: Value,
}

impl Field {
    const ID: u32 = FIELD_VER;

    fn int(tag: u64, value: i64) -> Field {
        Field { tag, value: Value::Int(value) }
    }
}

// Wire shape of a record, the kind code followed by the field map. Only
// present fields are transmitted.
#[derive(Debug, Clone, Eq, PartialEq, Cborize)]
struct Row {
    kind: u64,
    fields: Vec<Field>,
}

impl Row {
    const ID: u32 = ROW_VER;

    // serialize as one self-delimiting value, the unit the journal and
    // the replay cursor work in.
    fn to_bytes(self) -> Result<Vec<u8>> {
        let mut data = vec![];
        err_at!(FailCbor, err_at!(FailCbor, self.into_cbor())?.encode(&mut data))?;
        Ok(data)
    }
}

/// Record in the metadata log.
///
/// A flat shape with one discriminant and optional fields is preferred
/// over a sum type, the encoder must stay field-granular to keep the wire
/// format stable while fields come and go across versions.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Record {
    /// Kind of the record, `None` is not a valid state for a composed
    /// record, it only backs `Default`.
    kind: Option<Kind>,
    /// LSN from the time of index creation, identifies an incarnation.
    pub index_lsn: Option<i64>,
    /// Unique ID of a range.
    pub range_id: Option<i64>,
    /// Unique ID of a run.
    pub run_id: Option<i64>,
    /// Unique ID of a run slice.
    pub slice_id: Option<i64>,
    /// Start key of the range/slice, `None` when open towards -inf.
    pub begin: Option<Key>,
    /// End key of the range/slice, `None` when open towards +inf.
    pub end: Option<Key>,
    /// Ordinal index number in the space.
    pub index_id: Option<u32>,
    /// Space ID.
    pub space_id: Option<u32>,
    /// Index key definition, as defined by the user.
    pub key_parts: Option<Vec<KeyPart>>,
    /// Max LSN stored on disk.
    pub dump_lsn: Option<i64>,
    /// For dropped runs, signature of the last checkpoint using the run.
    pub gc_lsn: Option<i64>,
    /// Index truncate count.
    pub truncate_count: Option<i64>,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}{{", self.to_kind())?;
        let mut sep = "";
        if let Some(index_lsn) = self.index_lsn {
            write!(f, "{}index_lsn={}", sep, index_lsn)?;
            sep = ", ";
        }
        if let Some(range_id) = self.range_id {
            write!(f, "{}range_id={}", sep, range_id)?;
            sep = ", ";
        }
        if let Some(run_id) = self.run_id {
            write!(f, "{}run_id={}", sep, run_id)?;
            sep = ", ";
        }
        if let Some(begin) = &self.begin {
            write!(f, "{}begin={}", sep, key_str(begin))?;
            sep = ", ";
        }
        if let Some(end) = &self.end {
            write!(f, "{}end={}", sep, key_str(end))?;
            sep = ", ";
        }
        if let Some(index_id) = self.index_id {
            write!(f, "{}index_id={}", sep, index_id)?;
            sep = ", ";
        }
        if let Some(space_id) = self.space_id {
            write!(f, "{}space_id={}", sep, space_id)?;
            sep = ", ";
        }
        if let Some(key_parts) = &self.key_parts {
            let parts: Vec<String> = key_parts
                .iter()
                .map(|p| format!("{}:{}", p.field_no, p.field_type))
                .collect();
            write!(f, "{}key_def=[{}]", sep, parts.join(", "))?;
            sep = ", ";
        }
        if let Some(slice_id) = self.slice_id {
            write!(f, "{}slice_id={}", sep, slice_id)?;
            sep = ", ";
        }
        if let Some(dump_lsn) = self.dump_lsn {
            write!(f, "{}dump_lsn={}", sep, dump_lsn)?;
            sep = ", ";
        }
        if let Some(gc_lsn) = self.gc_lsn {
            write!(f, "{}gc_lsn={}", sep, gc_lsn)?;
            sep = ", ";
        }
        if let Some(truncate_count) = self.truncate_count {
            write!(f, "{}truncate_count={}", sep, truncate_count)?;
        }
        write!(f, "}}")
    }
}

fn key_str(key: &[Datum]) -> String {
    let items: Vec<String> = key.iter().map(|d| d.to_string()).collect();
    format!("[{}]", items.join(", "))
}

impl Record {
    fn with_kind(kind: Kind) -> Record {
        Record { kind: Some(kind), ..Record::default() }
    }

    /// Compose a record declaring an index incarnation.
    pub fn create_index(
        space_id: u32,
        index_id: u32,
        index_lsn: i64,
        key_parts: Vec<KeyPart>,
    ) -> Record {
        let mut record = Record::with_kind(Kind::CreateIndex);
        record.space_id = Some(space_id);
        record.index_id = Some(index_id);
        record.index_lsn = Some(index_lsn);
        record.key_parts = Some(key_parts);
        record
    }

    /// Compose a record marking an index incarnation dropped.
    pub fn drop_index(index_lsn: i64) -> Record {
        let mut record = Record::with_kind(Kind::DropIndex);
        record.index_lsn = Some(index_lsn);
        record
    }

    /// Compose a record adding a range to an index.
    pub fn insert_range(
        index_lsn: i64,
        range_id: i64,
        begin: Option<Key>,
        end: Option<Key>,
    ) -> Record {
        let mut record = Record::with_kind(Kind::InsertRange);
        record.index_lsn = Some(index_lsn);
        record.range_id = Some(range_id);
        record.begin = begin;
        record.end = end;
        record
    }

    /// Compose a record removing a range.
    pub fn delete_range(range_id: i64) -> Record {
        let mut record = Record::with_kind(Kind::DeleteRange);
        record.range_id = Some(range_id);
        record
    }

    /// Compose a record reserving a run id.
    pub fn prepare_run(index_lsn: i64, run_id: i64) -> Record {
        let mut record = Record::with_kind(Kind::PrepareRun);
        record.index_lsn = Some(index_lsn);
        record.run_id = Some(run_id);
        record
    }

    /// Compose a record confirming a run file.
    pub fn create_run(index_lsn: i64, run_id: i64, dump_lsn: i64) -> Record {
        let mut record = Record::with_kind(Kind::CreateRun);
        record.index_lsn = Some(index_lsn);
        record.run_id = Some(run_id);
        record.dump_lsn = Some(dump_lsn);
        record
    }

    /// Compose a record marking a run unused by the LSM.
    pub fn drop_run(run_id: i64, gc_lsn: i64) -> Record {
        let mut record = Record::with_kind(Kind::DropRun);
        record.run_id = Some(run_id);
        record.gc_lsn = Some(gc_lsn);
        record
    }

    /// Compose a record releasing a run entirely.
    pub fn forget_run(run_id: i64) -> Record {
        let mut record = Record::with_kind(Kind::ForgetRun);
        record.run_id = Some(run_id);
        record
    }

    /// Compose a record binding a run into a range.
    pub fn insert_slice(
        range_id: i64,
        run_id: i64,
        slice_id: i64,
        begin: Option<Key>,
        end: Option<Key>,
    ) -> Record {
        let mut record = Record::with_kind(Kind::InsertSlice);
        record.range_id = Some(range_id);
        record.run_id = Some(run_id);
        record.slice_id = Some(slice_id);
        record.begin = begin;
        record.end = end;
        record
    }

    /// Compose a record unbinding a slice.
    pub fn delete_slice(slice_id: i64) -> Record {
        let mut record = Record::with_kind(Kind::DeleteSlice);
        record.slice_id = Some(slice_id);
        record
    }

    /// Compose a record publishing the latest dump of an index.
    pub fn dump_index(index_lsn: i64, dump_lsn: i64) -> Record {
        let mut record = Record::with_kind(Kind::DumpIndex);
        record.index_lsn = Some(index_lsn);
        record.dump_lsn = Some(dump_lsn);
        record
    }

    /// Compose a record publishing the truncate count of an index.
    pub fn truncate_index(index_lsn: i64, truncate_count: i64) -> Record {
        let mut record = Record::with_kind(Kind::TruncateIndex);
        record.index_lsn = Some(index_lsn);
        record.truncate_count = Some(truncate_count);
        record
    }

    /// Compose an end-of-snapshot marker.
    pub fn snapshot() -> Record {
        Record::with_kind(Kind::Snapshot)
    }
}

impl Record {
    /// Return the record's kind.
    #[inline]
    pub fn to_kind(&self) -> Kind {
        self.kind.unwrap_or(Kind::Snapshot)
    }

    /// Encode this record into a journal row. Only present fields are
    /// written out.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut fields = vec![];
        if let Some(index_lsn) = self.index_lsn {
            fields.push(Field::int(KEY_INDEX_LSN, index_lsn));
        }
        if let Some(range_id) = self.range_id {
            fields.push(Field::int(KEY_RANGE_ID, range_id));
        }
        if let Some(run_id) = self.run_id {
            fields.push(Field::int(KEY_RUN_ID, run_id));
        }
        if let Some(begin) = &self.begin {
            fields.push(Field { tag: KEY_BEGIN, value: Value::Key(begin.clone()) });
        }
        if let Some(end) = &self.end {
            fields.push(Field { tag: KEY_END, value: Value::Key(end.clone()) });
        }
        if let Some(index_id) = self.index_id {
            fields.push(Field::int(KEY_INDEX_ID, index_id.into()));
        }
        if let Some(space_id) = self.space_id {
            fields.push(Field::int(KEY_SPACE_ID, space_id.into()));
        }
        if let Some(key_parts) = &self.key_parts {
            for part in key_parts.iter() {
                part.validate()?
            }
            fields.push(Field { tag: KEY_DEF, value: Value::Parts(key_parts.clone()) });
        }
        if let Some(slice_id) = self.slice_id {
            fields.push(Field::int(KEY_SLICE_ID, slice_id));
        }
        if let Some(dump_lsn) = self.dump_lsn {
            fields.push(Field::int(KEY_DUMP_LSN, dump_lsn));
        }
        if let Some(gc_lsn) = self.gc_lsn {
            fields.push(Field::int(KEY_GC_LSN, gc_lsn));
        }
        if let Some(truncate_count) = self.truncate_count {
            fields.push(Field::int(KEY_TRUNCATE_COUNT, truncate_count));
        }

        let row = Row { kind: self.to_kind() as u64, fields };
        row.to_bytes()
    }

    /// Decode a journal row into a record. Rows of unknown kind, with
    /// unknown field tags, or with malformed key-part definitions are
    /// rejected. Any subset of known fields is accepted.
    pub fn decode(buf: &[u8]) -> Result<Record> {
        let mut data = buf;
        let value = match Cbor::decode(&mut data) {
            Ok((value, _)) => value,
            Err(err) => return err_at!(InvalidLog, msg: "bad record: {}", err),
        };
        Record::from_row(value)
    }

    // Decode a record from an already parsed row value, used while
    // scanning a log file as a stream of rows.
    pub(crate) fn from_row(value: Cbor) -> Result<Record> {
        let row = match Row::from_cbor(value) {
            Ok(row) => row,
            Err(err) => return err_at!(InvalidLog, msg: "bad record: {}", err),
        };
        Record::try_from(row)
    }
}

impl TryFrom<Row> for Record {
    type Error = Error;

    fn try_from(row: Row) -> Result<Record> {
        let mut record = Record::with_kind(Kind::try_from(row.kind)?);
        for field in row.fields.into_iter() {
            match (field.tag, field.value) {
                (KEY_INDEX_LSN, Value::Int(val)) => record.index_lsn = Some(val),
                (KEY_RANGE_ID, Value::Int(val)) => record.range_id = Some(val),
                (KEY_RUN_ID, Value::Int(val)) => record.run_id = Some(val),
                // an empty key tuple stands for an open bound.
                (KEY_BEGIN, Value::Key(key)) => {
                    record.begin = if key.is_empty() { None } else { Some(key) }
                }
                (KEY_END, Value::Key(key)) => {
                    record.end = if key.is_empty() { None } else { Some(key) }
                }
                (KEY_INDEX_ID, Value::Int(val)) => {
                    let index_id = err_at!(FailConvert, u32::try_from(val))?;
                    record.index_id = Some(index_id);
                }
                (KEY_SPACE_ID, Value::Int(val)) => {
                    let space_id = err_at!(FailConvert, u32::try_from(val))?;
                    record.space_id = Some(space_id);
                }
                (KEY_DEF, Value::Parts(parts)) => {
                    for part in parts.iter() {
                        part.validate()?
                    }
                    record.key_parts = Some(parts);
                }
                (KEY_SLICE_ID, Value::Int(val)) => record.slice_id = Some(val),
                (KEY_DUMP_LSN, Value::Int(val)) => record.dump_lsn = Some(val),
                (KEY_GC_LSN, Value::Int(val)) => record.gc_lsn = Some(val),
                (KEY_TRUNCATE_COUNT, Value::Int(val)) => {
                    record.truncate_count = Some(val)
                }
                (tag, _) if tag > KEY_TRUNCATE_COUNT => {
                    return err_at!(InvalidLog, msg: "bad record: unknown tag {}", tag)
                }
                (tag, value) => {
                    return err_at!(
                        InvalidLog, msg: "bad record: tag {} value {:?}", tag, value
                    )
                }
            }
        }
        Ok(record)
    }
}

impl<'a> Arbitrary<'a> for Record {
    fn arbitrary(u: &mut Unstructured) -> arbitrary::Result<Self> {
        let kind = Kind::try_from(u.arbitrary::<u64>()? % 13).unwrap();
        let mut record = Record::with_kind(kind);

        let key = |u: &mut Unstructured| -> arbitrary::Result<Option<Key>> {
            match u.arbitrary::<u8>()? % 3 {
                0 => Ok(None),
                _ => {
                    let n = (u.arbitrary::<u8>()? % 3) + 1;
                    let mut key = vec![];
                    for _ in 0..n {
                        key.push(match u.arbitrary::<u8>()? % 4 {
                            0 => Datum::Unsigned(u.arbitrary()?),
                            1 => Datum::Integer(u.arbitrary()?),
                            2 => Datum::Str(u.arbitrary()?),
                            _ => Datum::Bytes(u.arbitrary()?),
                        })
                    }
                    Ok(Some(key))
                }
            }
        };

        match kind {
            Kind::CreateIndex => {
                record.space_id = Some(u.arbitrary()?);
                record.index_id = Some(u.arbitrary()?);
                record.index_lsn = Some(u.arbitrary::<u32>()?.into());
                let n = (u.arbitrary::<u8>()? % 3) + 1;
                let mut parts = vec![];
                for _ in 0..n {
                    parts.push(u.arbitrary::<KeyPart>()?)
                }
                record.key_parts = Some(parts);
            }
            Kind::DropIndex => record.index_lsn = Some(u.arbitrary::<u32>()?.into()),
            Kind::InsertRange => {
                record.index_lsn = Some(u.arbitrary::<u32>()?.into());
                record.range_id = Some(u.arbitrary::<u32>()?.into());
                record.begin = key(u)?;
                record.end = key(u)?;
            }
            Kind::DeleteRange => record.range_id = Some(u.arbitrary::<u32>()?.into()),
            Kind::PrepareRun => {
                record.index_lsn = Some(u.arbitrary::<u32>()?.into());
                record.run_id = Some(u.arbitrary::<u32>()?.into());
            }
            Kind::CreateRun => {
                record.index_lsn = Some(u.arbitrary::<u32>()?.into());
                record.run_id = Some(u.arbitrary::<u32>()?.into());
                record.dump_lsn = Some(u.arbitrary::<u32>()?.into());
            }
            Kind::DropRun => {
                record.run_id = Some(u.arbitrary::<u32>()?.into());
                record.gc_lsn = Some(u.arbitrary::<u32>()?.into());
            }
            Kind::ForgetRun => record.run_id = Some(u.arbitrary::<u32>()?.into()),
            Kind::InsertSlice => {
                record.range_id = Some(u.arbitrary::<u32>()?.into());
                record.run_id = Some(u.arbitrary::<u32>()?.into());
                record.slice_id = Some(u.arbitrary::<u32>()?.into());
                record.begin = key(u)?;
                record.end = key(u)?;
            }
            Kind::DeleteSlice => record.slice_id = Some(u.arbitrary::<u32>()?.into()),
            Kind::DumpIndex => {
                record.index_lsn = Some(u.arbitrary::<u32>()?.into());
                record.dump_lsn = Some(u.arbitrary::<u32>()?.into());
            }
            Kind::Snapshot => (),
            Kind::TruncateIndex => {
                record.index_lsn = Some(u.arbitrary::<u32>()?.into());
                record.truncate_count = Some(u.arbitrary::<u32>()?.into());
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
#[path = "record_test.rs"]
mod record_test;
