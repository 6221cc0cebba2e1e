//! Batch record format
//!
//! Every record starts with a one-byte tag. Data records come in a plain form
//! (column family 0) and a column-family form carrying a varint id:
//! ```text
//! +-----+-------------+-----------------+-----------------+
//! | Tag | [varint cf] | [varstring key] | [varstring val] |
//! +-----+-------------+-----------------+-----------------+
//! ```
//!
//! - Put, Merge: key + value
//! - Delete, SingleDelete: key
//! - DeleteRange: begin key + end key
//! - LogData: blob
//! - EndPrepare, Commit, Rollback: transaction id
//! - Noop, BeginPrepare: no payload

use crate::batch::coding::{
    get_length_prefixed_slice, get_varint32, put_length_prefixed_slice, put_varint32,
};
use crate::batch::error::{BatchError, BatchResult};
use crate::batch::write_batch::ContentFlags;

/// Record tags as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Deletion = 0x0,
    Value = 0x1,
    Merge = 0x2,
    LogData = 0x3,
    ColumnFamilyDeletion = 0x4,
    ColumnFamilyValue = 0x5,
    ColumnFamilyMerge = 0x6,
    SingleDeletion = 0x7,
    ColumnFamilySingleDeletion = 0x8,
    BeginPrepareXid = 0x9,
    EndPrepareXid = 0xA,
    CommitXid = 0xB,
    RollbackXid = 0xC,
    Noop = 0xD,
    ColumnFamilyRangeDeletion = 0xE,
    RangeDeletion = 0xF,
}

impl TryFrom<u8> for Tag {
    type Error = BatchError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Deletion),
            0x1 => Ok(Self::Value),
            0x2 => Ok(Self::Merge),
            0x3 => Ok(Self::LogData),
            0x4 => Ok(Self::ColumnFamilyDeletion),
            0x5 => Ok(Self::ColumnFamilyValue),
            0x6 => Ok(Self::ColumnFamilyMerge),
            0x7 => Ok(Self::SingleDeletion),
            0x8 => Ok(Self::ColumnFamilySingleDeletion),
            0x9 => Ok(Self::BeginPrepareXid),
            0xA => Ok(Self::EndPrepareXid),
            0xB => Ok(Self::CommitXid),
            0xC => Ok(Self::RollbackXid),
            0xD => Ok(Self::Noop),
            0xE => Ok(Self::ColumnFamilyRangeDeletion),
            0xF => Ok(Self::RangeDeletion),
            _ => Err(BatchError::corruption("unknown WriteBatch tag")),
        }
    }
}

impl Tag {
    /// True for the column-family forms that carry a varint id
    pub fn has_column_family(self) -> bool {
        matches!(
            self,
            Self::ColumnFamilyValue
                | Self::ColumnFamilyDeletion
                | Self::ColumnFamilySingleDeletion
                | Self::ColumnFamilyRangeDeletion
                | Self::ColumnFamilyMerge
        )
    }
}

/// The five data operations that consume a sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Put,
    Delete,
    SingleDelete,
    DeleteRange,
    Merge,
}

impl OpKind {
    pub fn plain_tag(self) -> Tag {
        match self {
            Self::Put => Tag::Value,
            Self::Delete => Tag::Deletion,
            Self::SingleDelete => Tag::SingleDeletion,
            Self::DeleteRange => Tag::RangeDeletion,
            Self::Merge => Tag::Merge,
        }
    }

    pub fn column_family_tag(self) -> Tag {
        match self {
            Self::Put => Tag::ColumnFamilyValue,
            Self::Delete => Tag::ColumnFamilyDeletion,
            Self::SingleDelete => Tag::ColumnFamilySingleDeletion,
            Self::DeleteRange => Tag::ColumnFamilyRangeDeletion,
            Self::Merge => Tag::ColumnFamilyMerge,
        }
    }

    pub fn content_flag(self) -> ContentFlags {
        match self {
            Self::Put => ContentFlags::HAS_PUT,
            Self::Delete => ContentFlags::HAS_DELETE,
            Self::SingleDelete => ContentFlags::HAS_SINGLE_DELETE,
            Self::DeleteRange => ContentFlags::HAS_DELETE_RANGE,
            Self::Merge => ContentFlags::HAS_MERGE,
        }
    }

    fn corruption_message(self) -> &'static str {
        match self {
            Self::Put => "bad WriteBatch Put",
            Self::Delete | Self::SingleDelete => "bad WriteBatch Delete",
            Self::DeleteRange => "bad WriteBatch DeleteRange",
            Self::Merge => "bad WriteBatch Merge",
        }
    }
}

/// A decoded record borrowing from the batch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    Put { cf: u32, key: &'a [u8], value: &'a [u8] },
    Delete { cf: u32, key: &'a [u8] },
    SingleDelete { cf: u32, key: &'a [u8] },
    DeleteRange { cf: u32, begin_key: &'a [u8], end_key: &'a [u8] },
    Merge { cf: u32, key: &'a [u8], value: &'a [u8] },
    LogData { blob: &'a [u8] },
    Noop,
    BeginPrepare,
    EndPrepare { xid: &'a [u8] },
    Commit { xid: &'a [u8] },
    Rollback { xid: &'a [u8] },
}

impl<'a> Record<'a> {
    /// Data operation carried by this record, if it is a counted record
    pub fn op_kind(&self) -> Option<OpKind> {
        match self {
            Self::Put { .. } => Some(OpKind::Put),
            Self::Delete { .. } => Some(OpKind::Delete),
            Self::SingleDelete { .. } => Some(OpKind::SingleDelete),
            Self::DeleteRange { .. } => Some(OpKind::DeleteRange),
            Self::Merge { .. } => Some(OpKind::Merge),
            _ => None,
        }
    }

    /// Whether this record contributes to the header count
    pub fn is_counted(&self) -> bool {
        self.op_kind().is_some()
    }

    /// Tag this record encodes to
    pub fn tag(&self) -> Tag {
        if let Some((op, cf)) = self.op_kind().zip(self.column_family()) {
            return if cf == 0 { op.plain_tag() } else { op.column_family_tag() };
        }
        match self {
            Self::LogData { .. } => Tag::LogData,
            Self::BeginPrepare => Tag::BeginPrepareXid,
            Self::EndPrepare { .. } => Tag::EndPrepareXid,
            Self::Commit { .. } => Tag::CommitXid,
            Self::Rollback { .. } => Tag::RollbackXid,
            _ => Tag::Noop,
        }
    }

    /// Column family of a data record
    pub fn column_family(&self) -> Option<u32> {
        match *self {
            Self::Put { cf, .. }
            | Self::Delete { cf, .. }
            | Self::SingleDelete { cf, .. }
            | Self::DeleteRange { cf, .. }
            | Self::Merge { cf, .. } => Some(cf),
            _ => None,
        }
    }

    /// Content flag contributed by this record (empty for LogData and Noop)
    pub fn content_flag(&self) -> ContentFlags {
        if let Some(op) = self.op_kind() {
            return op.content_flag();
        }
        match self {
            Self::BeginPrepare => ContentFlags::HAS_BEGIN_PREPARE,
            Self::EndPrepare { .. } => ContentFlags::HAS_END_PREPARE,
            Self::Commit { .. } => ContentFlags::HAS_COMMIT,
            Self::Rollback { .. } => ContentFlags::HAS_ROLLBACK,
            _ => ContentFlags::empty(),
        }
    }

    /// Append the wire form of this record to `dst`
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.push(self.tag() as u8);
        if let Some(cf) = self.column_family() {
            if cf != 0 {
                put_varint32(dst, cf);
            }
        }
        match *self {
            Self::Put { key, value, .. } | Self::Merge { key, value, .. } => {
                put_length_prefixed_slice(dst, key);
                put_length_prefixed_slice(dst, value);
            }
            Self::Delete { key, .. } | Self::SingleDelete { key, .. } => {
                put_length_prefixed_slice(dst, key);
            }
            Self::DeleteRange {
                begin_key, end_key, ..
            } => {
                put_length_prefixed_slice(dst, begin_key);
                put_length_prefixed_slice(dst, end_key);
            }
            Self::LogData { blob } => put_length_prefixed_slice(dst, blob),
            Self::EndPrepare { xid } | Self::Commit { xid } | Self::Rollback { xid } => {
                put_length_prefixed_slice(dst, xid);
            }
            Self::Noop | Self::BeginPrepare => {}
        }
    }

    /// Decode one record from the front of `input`.
    ///
    /// On success `input` is advanced past the record. On failure `input` is
    /// left where it was.
    pub fn decode(input: &mut &'a [u8]) -> BatchResult<Self> {
        let mut cursor = *input;
        let (&first, rest) = cursor
            .split_first()
            .ok_or_else(|| BatchError::corruption("unknown WriteBatch tag"))?;
        cursor = rest;
        let tag = Tag::try_from(first)?;

        let record = match tag {
            Tag::Value | Tag::ColumnFamilyValue => {
                let (cf, key, value) = decode_two(&mut cursor, tag, OpKind::Put)?;
                Self::Put { cf, key, value }
            }
            Tag::Merge | Tag::ColumnFamilyMerge => {
                let (cf, key, value) = decode_two(&mut cursor, tag, OpKind::Merge)?;
                Self::Merge { cf, key, value }
            }
            Tag::RangeDeletion | Tag::ColumnFamilyRangeDeletion => {
                let (cf, begin_key, end_key) =
                    decode_two(&mut cursor, tag, OpKind::DeleteRange)?;
                Self::DeleteRange {
                    cf,
                    begin_key,
                    end_key,
                }
            }
            Tag::Deletion | Tag::ColumnFamilyDeletion => {
                let (cf, key) = decode_one(&mut cursor, tag, OpKind::Delete)?;
                Self::Delete { cf, key }
            }
            Tag::SingleDeletion | Tag::ColumnFamilySingleDeletion => {
                let (cf, key) = decode_one(&mut cursor, tag, OpKind::SingleDelete)?;
                Self::SingleDelete { cf, key }
            }
            Tag::LogData => Self::LogData {
                blob: get_length_prefixed_slice(&mut cursor)
                    .ok_or_else(|| BatchError::corruption("bad WriteBatch Blob"))?,
            },
            Tag::Noop => Self::Noop,
            Tag::BeginPrepareXid => Self::BeginPrepare,
            Tag::EndPrepareXid => Self::EndPrepare {
                xid: get_length_prefixed_slice(&mut cursor)
                    .ok_or_else(|| BatchError::corruption("bad EndPrepare XID"))?,
            },
            Tag::CommitXid => Self::Commit {
                xid: get_length_prefixed_slice(&mut cursor)
                    .ok_or_else(|| BatchError::corruption("bad Commit XID"))?,
            },
            Tag::RollbackXid => Self::Rollback {
                xid: get_length_prefixed_slice(&mut cursor)
                    .ok_or_else(|| BatchError::corruption("bad Rollback XID"))?,
            },
        };

        *input = cursor;
        Ok(record)
    }
}

fn decode_column_family(input: &mut &[u8], tag: Tag, op: OpKind) -> BatchResult<u32> {
    if !tag.has_column_family() {
        return Ok(0);
    }
    get_varint32(input).ok_or_else(|| BatchError::corruption(op.corruption_message()))
}

fn decode_one<'a>(input: &mut &'a [u8], tag: Tag, op: OpKind) -> BatchResult<(u32, &'a [u8])> {
    let cf = decode_column_family(input, tag, op)?;
    let key = get_length_prefixed_slice(input)
        .ok_or_else(|| BatchError::corruption(op.corruption_message()))?;
    Ok((cf, key))
}

fn decode_two<'a>(
    input: &mut &'a [u8],
    tag: Tag,
    op: OpKind,
) -> BatchResult<(u32, &'a [u8], &'a [u8])> {
    let (cf, first) = decode_one(input, tag, op)?;
    let second = get_length_prefixed_slice(input)
        .ok_or_else(|| BatchError::corruption(op.corruption_message()))?;
    Ok((cf, first, second))
}

/// Extract the key of a raw Put/Delete/SingleDelete/Merge entry.
///
/// `entry` starts at the tag byte; `cf_record` says whether a varint column
/// family id follows the tag.
pub fn read_key_from_entry<'a>(entry: &'a [u8], cf_record: bool) -> Option<&'a [u8]> {
    let mut input = entry.get(1..)?;
    if cf_record {
        get_varint32(&mut input)?;
    }
    get_length_prefixed_slice(&mut input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: Record<'_>) {
        let mut buf = Vec::new();
        record.encode(&mut buf);
        let mut input = buf.as_slice();
        let decoded = Record::decode(&mut input).unwrap();
        assert_eq!(decoded, record);
        assert!(input.is_empty());
    }

    #[test]
    fn test_record_roundtrip_each_kind() {
        roundtrip(Record::Put { cf: 0, key: b"k", value: b"v" });
        roundtrip(Record::Put { cf: 7, key: b"k", value: b"" });
        roundtrip(Record::Delete { cf: 300, key: b"gone" });
        roundtrip(Record::SingleDelete { cf: 0, key: b"once" });
        roundtrip(Record::DeleteRange { cf: 2, begin_key: b"a", end_key: b"m" });
        roundtrip(Record::Merge { cf: 0, key: b"ctr", value: b"+1" });
        roundtrip(Record::LogData { blob: b"opaque" });
        roundtrip(Record::Noop);
        roundtrip(Record::BeginPrepare);
        roundtrip(Record::EndPrepare { xid: b"t1" });
        roundtrip(Record::Commit { xid: b"t1" });
        roundtrip(Record::Rollback { xid: b"" });
    }

    #[test]
    fn test_plain_and_column_family_tags() {
        let mut buf = Vec::new();
        Record::Put { cf: 0, key: b"k", value: b"v" }.encode(&mut buf);
        assert_eq!(buf, vec![Tag::Value as u8, 1, b'k', 1, b'v']);

        buf.clear();
        Record::Put { cf: 129, key: b"k", value: b"v" }.encode(&mut buf);
        assert_eq!(
            buf,
            vec![Tag::ColumnFamilyValue as u8, 0x81, 0x01, 1, b'k', 1, b'v']
        );
    }

    #[test]
    fn test_explicit_zero_column_family_decodes() {
        let buf = [Tag::ColumnFamilyDeletion as u8, 0, 1, b'x'];
        let mut input = &buf[..];
        let record = Record::decode(&mut input).unwrap();
        assert_eq!(record, Record::Delete { cf: 0, key: b"x" });
    }

    #[test]
    fn test_unknown_tag() {
        let mut input: &[u8] = &[0x42, 0, 0];
        let err = Record::decode(&mut input).unwrap_err();
        assert_eq!(err, BatchError::corruption("unknown WriteBatch tag"));
        assert_eq!(input.len(), 3);
    }

    #[test]
    fn test_truncated_messages() {
        let cases: [(Record<'_>, &str); 6] = [
            (Record::Put { cf: 1, key: b"key", value: b"value" }, "bad WriteBatch Put"),
            (Record::SingleDelete { cf: 0, key: b"key" }, "bad WriteBatch Delete"),
            (
                Record::DeleteRange { cf: 0, begin_key: b"a", end_key: b"z" },
                "bad WriteBatch DeleteRange",
            ),
            (Record::Merge { cf: 0, key: b"k", value: b"v" }, "bad WriteBatch Merge"),
            (Record::LogData { blob: b"blob" }, "bad WriteBatch Blob"),
            (Record::Commit { xid: b"xid" }, "bad Commit XID"),
        ];
        for (record, message) in cases {
            let mut buf = Vec::new();
            record.encode(&mut buf);
            let mut input = &buf[..buf.len() - 1];
            let err = Record::decode(&mut input).unwrap_err();
            assert_eq!(err, BatchError::corruption(message));
        }
    }

    #[test]
    fn test_read_key_from_entry() {
        let mut buf = Vec::new();
        Record::Merge { cf: 5, key: b"mk", value: b"mv" }.encode(&mut buf);
        assert_eq!(read_key_from_entry(&buf, true), Some(&b"mk"[..]));

        buf.clear();
        Record::Delete { cf: 0, key: b"dk" }.encode(&mut buf);
        assert_eq!(read_key_from_entry(&buf, false), Some(&b"dk"[..]));
    }
}
