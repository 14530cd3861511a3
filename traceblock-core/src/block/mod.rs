//! Compacted block implementation
//!
//! A block is an append-only data file of framed `(id, payload)` objects
//! plus three derived artifacts:
//! - Block meta with time and id bounds
//! - Bloom filter over every written id
//! - Sparse index with one record per `downsample` objects

mod bloom;
mod compactor;
mod index;
mod object;
mod store;

pub use bloom::BloomFilter;
pub use compactor::{CompactorBlock, CompletedBlock, BLOOM_FILE, INDEX_FILE, META_FILE};
pub use index::{IndexBuilder, IndexRecord, Records};
pub use object::{decode_object, encode_object, ObjectIter, FRAME_OVERHEAD};
pub use store::{BlockStore, FileStore, MemoryStore};

use crate::{BlockError, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Block file format version
pub const FORMAT_VERSION: u32 = 1;

/// Block metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Format version of the data file
    pub version: u32,
    /// Unique block id
    pub block_id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Earliest start time across the source blocks
    pub start_time: DateTime<Utc>,
    /// Latest end time across the source blocks
    pub end_time: DateTime<Utc>,
    /// Smallest id written, `None` until the first write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_id: Option<Id>,
    /// Largest id written, `None` until the first write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<Id>,
    /// Number of objects written
    pub total_objects: usize,
}

impl BlockMeta {
    /// Create an empty meta with a fixed time range
    pub fn new(
        block_id: Uuid,
        tenant_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_id,
            tenant_id: tenant_id.into(),
            start_time,
            end_time,
            min_id: None,
            max_id: None,
            total_objects: 0,
        }
    }

    /// Create the meta for a compaction output from its source metas.
    ///
    /// The time range is the union of the sources' ranges and is not
    /// touched again by writes.
    pub fn from_sources(
        block_id: Uuid,
        tenant_id: impl Into<String>,
        sources: &[BlockMeta],
    ) -> Result<Self> {
        let (first, rest) = sources
            .split_first()
            .ok_or_else(|| BlockError::InvalidArgument("empty block meta list".into()))?;

        let mut start_time = first.start_time;
        let mut end_time = first.end_time;
        for meta in rest {
            start_time = start_time.min(meta.start_time);
            end_time = end_time.max(meta.end_time);
        }

        Ok(Self::new(block_id, tenant_id, start_time, end_time))
    }

    /// Record a written id. Ties keep the bound seen first.
    pub fn object_added(&mut self, id: &Id) {
        match &self.min_id {
            Some(min) if id >= min => {}
            _ => self.min_id = Some(id.clone()),
        }
        match &self.max_id {
            Some(max) if id <= max => {}
            _ => self.max_id = Some(id.clone()),
        }
        self.total_objects += 1;
    }

    /// Check if an id falls inside the block's id bounds
    pub fn may_contain_id(&self, id: &Id) -> bool {
        match (&self.min_id, &self.max_id) {
            (Some(min), Some(max)) => id >= min && id <= max,
            _ => false,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
