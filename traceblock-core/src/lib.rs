//! TraceBlock Core - compacted block construction for a trace WAL
//!
//! During compaction, durable but unoptimized WAL segments are merged and
//! rewritten into a single immutable block. This crate builds that block:
//!
//! - **Block store**: append-only persistence of `(id, payload)` objects
//! - **Bloom filter**: probabilistic membership test over object ids
//! - **Sparse index**: one record per run of `downsample` objects
//! - **Block meta**: tenant, time range, id range and object count
//!
//! The [`CompactorBlock`] ties these together and is handed out by the
//! [`Wal`] with its configured downsample factor and false-positive rate.

pub mod block;
pub mod wal;

mod error;
mod types;

pub use block::{
    BlockMeta, BlockStore, BloomFilter, CompactorBlock, CompletedBlock, FileStore, IndexRecord,
    MemoryStore, Records,
};
pub use error::{BlockError, Result};
pub use types::Id;
pub use wal::{Wal, WalConfig};

/// TraceBlock version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Objects per sparse index record
    pub const DEFAULT_INDEX_DOWNSAMPLE: usize = 100;

    /// Bloom filter false positive rate
    pub const DEFAULT_BLOOM_FP: f64 = 0.01;

    /// Name of the subdirectory holding completed blocks
    pub const COMPLETED_DIR: &str = "completed";
}
