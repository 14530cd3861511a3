//! Sparse index over runs of consecutively written objects
//!
//! Every `downsample` objects the builder closes a record holding the
//! run's byte range and id bounds. Readers binary search the records by
//! id span and scan a single run, so spans only increase when the block
//! was written in id order.

use crate::{BlockError, Id, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;

/// Index record for one run of objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Offset of the run's first object in the data file
    pub start_offset: u64,
    /// Byte length of the run
    pub length: u64,
    /// Smallest id in the run
    pub min_id: Id,
    /// Largest id in the run
    pub max_id: Id,
}

impl IndexRecord {
    /// Check whether an id falls inside the record's span
    pub fn contains(&self, id: &Id) -> bool {
        id >= &self.min_id && id <= &self.max_id
    }
}

/// Ordered, replayable sequence of index records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Records(Vec<IndexRecord>);

impl Records {
    /// Number of records
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the block holds no objects
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate records in write order
    pub fn iter(&self) -> std::slice::Iter<'_, IndexRecord> {
        self.0.iter()
    }

    /// Record at position `index`
    pub fn get(&self, index: usize) -> Option<&IndexRecord> {
        self.0.get(index)
    }

    /// Find the run that may hold `id`.
    ///
    /// Assumes the block was written in id order.
    pub fn find(&self, id: &Id) -> Option<&IndexRecord> {
        self.0
            .binary_search_by(|record| {
                if &record.max_id < id {
                    Ordering::Less
                } else if &record.min_id > id {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .ok()
            .map(|i| &self.0[i])
    }

    /// Serialize all records with a trailing CRC32
    ///
    /// Format:
    /// - 4 bytes: record count
    /// - per record: 2 bytes + min id, 2 bytes + max id, 8 bytes offset, 8 bytes length
    /// - 4 bytes: CRC32 checksum
    pub fn encode(&self) -> Result<Bytes> {
        let count = u32::try_from(self.0.len()).map_err(|_| {
            BlockError::InvalidFormat(format!("too many index records: {}", self.0.len()))
        })?;

        let mut buf = BytesMut::new();
        buf.put_u32_le(count);
        for record in &self.0 {
            buf.put_u16_le(record.min_id.len() as u16);
            buf.put_slice(record.min_id.as_bytes());
            buf.put_u16_le(record.max_id.len() as u16);
            buf.put_slice(record.max_id.as_bytes());
            buf.put_u64_le(record.start_offset);
            buf.put_u64_le(record.length);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Deserialize records produced by [`Records::encode`]
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(BlockError::InvalidFormat("Index too short".into()));
        }

        let body = &data[..data.len() - 4];
        let expected = {
            let mut c = std::io::Cursor::new(&data[data.len() - 4..]);
            c.get_u32_le()
        };
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(BlockError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let count = cursor.get_u32_le() as usize;
        let mut records = Vec::with_capacity(count.min(body.len()));

        for _ in 0..count {
            let min_id = read_id(&mut cursor)?;
            let max_id = read_id(&mut cursor)?;
            if cursor.remaining() < 16 {
                return Err(BlockError::InvalidFormat("Truncated index record".into()));
            }
            records.push(IndexRecord {
                start_offset: cursor.get_u64_le(),
                length: cursor.get_u64_le(),
                min_id,
                max_id,
            });
        }

        if cursor.has_remaining() {
            return Err(BlockError::InvalidFormat(format!(
                "{} trailing bytes after index records",
                cursor.remaining()
            )));
        }

        Ok(Self(records))
    }
}

impl From<Vec<IndexRecord>> for Records {
    fn from(records: Vec<IndexRecord>) -> Self {
        Self(records)
    }
}

impl<'a> IntoIterator for &'a Records {
    type Item = &'a IndexRecord;
    type IntoIter = std::slice::Iter<'a, IndexRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn read_id(cursor: &mut &[u8]) -> Result<Id> {
    if cursor.remaining() < 2 {
        return Err(BlockError::InvalidFormat("Truncated index id length".into()));
    }
    let len = cursor.get_u16_le() as usize;
    if cursor.remaining() < len {
        return Err(BlockError::InvalidFormat("Truncated index id".into()));
    }
    let id = Id::from_slice(&cursor[..len]).map_err(|e| BlockError::InvalidFormat(e.to_string()))?;
    cursor.advance(len);
    Ok(id)
}

// Upper bound on records allocated up front from the expected count
const MAX_PRESIZED_RECORDS: usize = 1 << 16;

/// Run accumulator producing one record per `downsample` objects
#[derive(Debug)]
pub struct IndexBuilder {
    downsample: usize,
    records: Vec<IndexRecord>,

    // Current run
    run_start: u64,
    run_length: u64,
    run_count: usize,
    run_min: Option<Id>,
    run_max: Option<Id>,
}

impl IndexBuilder {
    /// Create a builder, pre-sizing for `expected_objects`
    pub fn new(downsample: usize, expected_objects: usize) -> Self {
        let downsample = downsample.max(1);
        let capacity = expected_objects.div_ceil(downsample).min(MAX_PRESIZED_RECORDS);
        Self {
            downsample,
            records: Vec::with_capacity(capacity),
            run_start: 0,
            run_length: 0,
            run_count: 0,
            run_min: None,
            run_max: None,
        }
    }

    /// Add an object written at `offset` with `length` bytes
    pub fn add(&mut self, id: &Id, offset: u64, length: u64) {
        if self.run_count == 0 {
            self.run_start = offset;
            self.run_length = 0;
        }

        self.run_length += length;
        self.run_count += 1;

        match &self.run_min {
            Some(min) if id >= min => {}
            _ => self.run_min = Some(id.clone()),
        }
        match &self.run_max {
            Some(max) if id <= max => {}
            _ => self.run_max = Some(id.clone()),
        }

        if self.run_count >= self.downsample {
            self.close_run();
        }
    }

    /// Close any partial run and return all records
    pub fn finish(mut self) -> Records {
        if self.run_count > 0 {
            self.close_run();
        }
        Records(self.records)
    }

    fn close_run(&mut self) {
        if let (Some(min_id), Some(max_id)) = (self.run_min.take(), self.run_max.take()) {
            self.records.push(IndexRecord {
                start_offset: self.run_start,
                length: self.run_length,
                min_id,
                max_id,
            });
        }
        self.run_start += self.run_length;
        self.run_length = 0;
        self.run_count = 0;
    }
}
