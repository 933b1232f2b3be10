//! File layout: magic, segment table, segment ids.
//!
//! ```text
//! u64  magic
//! u8   segment count
//! N x (u8 id, u64 offset, u64 length, u32 records)
//! segment bytes...
//! ```
//! Offsets are absolute from the start of the file.

use serde::Serialize;

use crate::errors::PersistError;
use crate::world::entity::EntityKind;

use super::codec::{DecodeResult, Reader, Writer};

pub const MAGIC: u64 = 0x6BB5_0D00_B87E_33A4;

/// Newest layout this build writes and reads.
pub const FORMAT_VERSION: u16 = 1;

/// Bytes per entry in the segment table.
pub const SEGMENT_HEADER_LEN: usize = 1 + 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SegmentId {
    Accounts = 0x01,
    Map = 0x02,
    Timers = 0x03,
    WorldMeta = 0x04,
    Items = 0x11,
    Containers = 0x12,
    Mobiles = 0x13,
}

impl SegmentId {
    pub const OBJECTS: [SegmentId; 3] = [SegmentId::Items, SegmentId::Containers, SegmentId::Mobiles];

    pub fn from_code(code: u8) -> Option<SegmentId> {
        [
            SegmentId::Accounts,
            SegmentId::Map,
            SegmentId::Timers,
            SegmentId::WorldMeta,
            SegmentId::Items,
            SegmentId::Containers,
            SegmentId::Mobiles,
        ]
        .into_iter()
        .find(|id| *id as u8 == code)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Object segment holding records of `kind` (`0x10 + type code`).
    pub fn for_kind(kind: EntityKind) -> SegmentId {
        match kind {
            EntityKind::Item => SegmentId::Items,
            EntityKind::Container => SegmentId::Containers,
            EntityKind::Mobile => SegmentId::Mobiles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentHeader {
    pub id: u8,
    pub offset: u64,
    pub length: u64,
    pub records: u32,
}

impl SegmentHeader {
    pub fn segment(&self) -> Option<SegmentId> {
        SegmentId::from_code(self.id)
    }

    /// Whether the segment's bytes lie entirely inside a file of `file_len` bytes.
    pub fn within(&self, file_len: usize) -> bool {
        self.offset
            .checked_add(self.length)
            .is_some_and(|end| end <= file_len as u64)
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.length) as usize
    }
}

/// A segment body waiting to be laid out.
pub struct SegmentBody {
    pub id: SegmentId,
    pub records: u32,
    pub bytes: Vec<u8>,
}

/// Lay out the header table followed by every body, in the order given.
pub fn assemble(segments: &[SegmentBody]) -> (Vec<u8>, Vec<SegmentHeader>) {
    let mut offset = (8 + 1 + segments.len() * SEGMENT_HEADER_LEN) as u64;
    let mut headers = Vec::with_capacity(segments.len());
    for body in segments {
        headers.push(SegmentHeader {
            id: body.id.code(),
            offset,
            length: body.bytes.len() as u64,
            records: body.records,
        });
        offset += body.bytes.len() as u64;
    }

    let mut w = Writer::new();
    w.u64(MAGIC);
    w.u8(segments.len() as u8);
    for header in &headers {
        w.u8(header.id);
        w.u64(header.offset);
        w.u64(header.length);
        w.u32(header.records);
    }
    for body in segments {
        w.bytes(&body.bytes);
    }
    (w.into_vec(), headers)
}

fn read_segment_header(r: &mut Reader<'_>) -> DecodeResult<SegmentHeader> {
    Ok(SegmentHeader {
        id: r.u8()?,
        offset: r.u64()?,
        length: r.u64()?,
        records: r.u32()?,
    })
}

/// Read the header table of a whole file. Entries are returned as written;
/// use [`SegmentHeader::within`] before slicing a segment out of `file`.
pub fn parse_header(file: &[u8]) -> Result<Vec<SegmentHeader>, PersistError> {
    let mut r = Reader::new(file);
    let magic = r.u64().map_err(|_| PersistError::TruncatedHeader)?;
    if magic != MAGIC {
        return Err(PersistError::BadMagic(magic));
    }
    let count = r.u8().map_err(|_| PersistError::TruncatedHeader)?;
    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        headers.push(read_segment_header(&mut r).map_err(|_| PersistError::TruncatedHeader)?);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let (file, headers) = assemble(&[
            SegmentBody {
                id: SegmentId::Map,
                records: 2,
                bytes: vec![1, 2, 3],
            },
            SegmentBody {
                id: SegmentId::Items,
                records: 0,
                bytes: vec![],
            },
        ]);
        assert_eq!(&file[..8], &MAGIC.to_le_bytes());
        let parsed = parse_header(&file).expect("parse");
        assert_eq!(parsed, headers);
        assert_eq!(&file[parsed[0].range()], &[1, 2, 3]);
    }

    #[test]
    fn bad_magic_and_truncation_are_fatal() {
        assert!(matches!(parse_header(&[0u8; 9]), Err(PersistError::BadMagic(0))));
        assert!(matches!(parse_header(&[1, 2]), Err(PersistError::TruncatedHeader)));
        let mut file = MAGIC.to_le_bytes().to_vec();
        file.push(1);
        assert!(matches!(parse_header(&file), Err(PersistError::TruncatedHeader)));
    }

    #[test]
    fn segment_past_end_is_listed_but_not_within() {
        let (mut file, _) = assemble(&[SegmentBody {
            id: SegmentId::Map,
            records: 0,
            bytes: vec![9; 4],
        }]);
        assert!(parse_header(&file).expect("parse")[0].within(file.len()));
        file.truncate(file.len() - 1);
        let parsed = parse_header(&file).expect("table is intact");
        assert_eq!(parsed[0].id, 0x02);
        assert!(!parsed[0].within(file.len()));

        let overflow = SegmentHeader {
            id: 0x11,
            offset: u64::MAX,
            length: 2,
            records: 0,
        };
        assert!(!overflow.within(usize::MAX));
    }
}
