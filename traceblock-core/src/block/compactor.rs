//! Compacted block builder
//!
//! Objects are streamed in, appended to the block store and folded into
//! the bloom filter, the sparse index and the block meta as they arrive.
//! Nothing is buffered beyond the current index run.

use super::object::encode_object;
use super::{BlockMeta, BlockStore, BloomFilter, FileStore, IndexBuilder, IndexRecord, Records};
use crate::{BlockError, Id, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// File name of persisted block meta
pub const META_FILE: &str = "meta.json";
/// File name of the persisted bloom filter
pub const BLOOM_FILE: &str = "bloom";
/// File name of the persisted sparse index
pub const INDEX_FILE: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Writing,
    Completed,
    Poisoned,
}

/// Builder for one compacted block.
///
/// Writes must be issued sequentially by a single compaction worker.
/// After any failed `write` or `complete` the block is poisoned and must
/// be discarded; the caller is responsible for removing its data with
/// [`CompactorBlock::clear`].
pub struct CompactorBlock<S: BlockStore = FileStore> {
    meta: BlockMeta,
    bloom: BloomFilter,
    index: Option<IndexBuilder>,
    records: Records,
    store: S,
    data_path: Option<PathBuf>,
    downsample: usize,
    bytes_written: u64,
    last_id: Option<Id>,
    in_order: bool,
    state: State,
}

impl CompactorBlock<FileStore> {
    /// Create a block writing to `<destination>/<block_id>:<tenant_id>`.
    ///
    /// All arguments are validated before the data file is created.
    pub fn new(
        block_id: Uuid,
        destination: impl AsRef<Path>,
        tenant_id: &str,
        metas: &[BlockMeta],
        expected_objects: usize,
        downsample: usize,
        bloom_fp: f64,
    ) -> Result<Self> {
        let destination = destination.as_ref();
        if destination.as_os_str().is_empty() {
            return Err(BlockError::InvalidArgument(
                "please provide a destination path for the block".into(),
            ));
        }

        let (meta, bloom, index) =
            Self::prepare(block_id, tenant_id, metas, expected_objects, downsample, bloom_fp)?;

        let path = destination.join(format!("{}:{}", block_id, tenant_id));
        let store = FileStore::create(&path)?;

        Ok(Self::assemble(meta, bloom, index, store, Some(path), downsample))
    }
}

impl<S: BlockStore> CompactorBlock<S> {
    /// Create a block over an arbitrary store, with the same validation as [`CompactorBlock::new`]
    pub fn with_store(
        store: S,
        block_id: Uuid,
        tenant_id: &str,
        metas: &[BlockMeta],
        expected_objects: usize,
        downsample: usize,
        bloom_fp: f64,
    ) -> Result<Self> {
        let (meta, bloom, index) =
            Self::prepare(block_id, tenant_id, metas, expected_objects, downsample, bloom_fp)?;

        Ok(Self::assemble(meta, bloom, index, store, None, downsample))
    }

    fn prepare(
        block_id: Uuid,
        tenant_id: &str,
        metas: &[BlockMeta],
        expected_objects: usize,
        downsample: usize,
        bloom_fp: f64,
    ) -> Result<(BlockMeta, BloomFilter, IndexBuilder)> {
        if block_id.is_nil() {
            return Err(BlockError::InvalidArgument("block id must be set".into()));
        }
        if tenant_id.is_empty() {
            return Err(BlockError::InvalidArgument("tenant id must be set".into()));
        }
        if tenant_id.contains(['/', '\\']) {
            return Err(BlockError::InvalidArgument(format!(
                "tenant id {:?} contains a path separator",
                tenant_id
            )));
        }
        if downsample == 0 {
            return Err(BlockError::InvalidArgument(
                "index downsample must be at least 1".into(),
            ));
        }
        if expected_objects == 0 {
            return Err(BlockError::InvalidArgument(
                "must have non-zero positive estimated objects for a reliable bloom filter".into(),
            ));
        }

        let meta = BlockMeta::from_sources(block_id, tenant_id, metas)?;
        let bloom = BloomFilter::with_rate(expected_objects, bloom_fp)?;
        let index = IndexBuilder::new(downsample, expected_objects);

        debug!(
            block_id = %block_id,
            tenant_id,
            sources = metas.len(),
            expected_objects,
            downsample,
            bloom_fp,
            "Creating compactor block"
        );

        Ok((meta, bloom, index))
    }

    fn assemble(
        meta: BlockMeta,
        bloom: BloomFilter,
        index: IndexBuilder,
        store: S,
        data_path: Option<PathBuf>,
        downsample: usize,
    ) -> Self {
        Self {
            meta,
            bloom,
            index: Some(index),
            records: Records::default(),
            store,
            data_path,
            downsample,
            bytes_written: 0,
            last_id: None,
            in_order: true,
            state: State::Writing,
        }
    }

    /// Append one object.
    ///
    /// Ids are expected in ascending order, as produced by the compaction
    /// merge; the sparse index can only be searched when that holds.
    /// Out of order writes are accepted and still tracked in the bounds.
    pub fn write(&mut self, id: &[u8], payload: &[u8]) -> Result<()> {
        match self.state {
            State::Writing => {}
            State::Completed => {
                return Err(BlockError::InvalidState("block already completed".into()))
            }
            State::Poisoned => return Err(BlockError::Poisoned),
        }

        let result = self.append(id, payload);
        if result.is_err() {
            self.state = State::Poisoned;
        }
        result
    }

    fn append(&mut self, id: &[u8], payload: &[u8]) -> Result<()> {
        let id = Id::from_slice(id)?;
        let frame = encode_object(&id, payload)?;
        let (offset, length) = self.store.append(&frame)?;

        self.bloom.add(id.as_bytes());
        self.meta.object_added(&id);
        if let Some(index) = self.index.as_mut() {
            index.add(&id, offset, length);
        }
        self.bytes_written += length;

        if let Some(last) = &self.last_id {
            if &id < last {
                self.in_order = false;
            }
        }
        self.last_id = Some(id);

        Ok(())
    }

    /// Flush the store and close the last partial index run.
    ///
    /// Must be called exactly once, after the last write.
    pub fn complete(&mut self) -> Result<()> {
        match self.state {
            State::Writing => {}
            State::Completed => {
                return Err(BlockError::InvalidState("block already completed".into()))
            }
            State::Poisoned => return Err(BlockError::Poisoned),
        }

        if let Err(e) = self.store.flush() {
            self.state = State::Poisoned;
            return Err(e);
        }

        if let Some(index) = self.index.take() {
            self.records = index.finish();
        }
        self.last_id = None;
        self.state = State::Completed;

        info!(
            block_id = %self.meta.block_id,
            tenant_id = %self.meta.tenant_id,
            objects = self.meta.total_objects,
            records = self.records.len(),
            bytes = self.bytes_written,
            "Completed compactor block"
        );

        Ok(())
    }

    /// Number of objects written
    pub fn length(&self) -> usize {
        self.meta.total_objects
    }

    /// Current block meta; id bounds and count are final after `complete`
    pub fn block_meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Bloom filter over every written id
    pub fn bloom_filter(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Sparse index records; empty until `complete`
    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Block id
    pub fn block_id(&self) -> Uuid {
        self.meta.block_id
    }

    /// Owning tenant
    pub fn tenant_id(&self) -> &str {
        &self.meta.tenant_id
    }

    /// Objects per index record
    pub fn downsample(&self) -> usize {
        self.downsample
    }

    /// Bytes appended to the store
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Data file location, for file backed blocks
    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// True once `complete` has succeeded
    pub fn is_completed(&self) -> bool {
        self.state == State::Completed
    }

    /// True after a failed `write` or `complete`
    pub fn is_poisoned(&self) -> bool {
        self.state == State::Poisoned
    }

    /// False if any id was written below its predecessor
    pub fn written_in_order(&self) -> bool {
        self.in_order
    }

    /// Discard the block and remove its data file
    pub fn clear(self) -> Result<()> {
        let path = self.data_path.clone();
        drop(self);

        if let Some(path) = path {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Hand the finished artifacts to the caller
    pub fn into_completed(self) -> Result<CompletedBlock> {
        match self.state {
            State::Completed => Ok(CompletedBlock {
                meta: self.meta,
                bloom: self.bloom,
                records: self.records,
                data_path: self.data_path,
            }),
            State::Writing => Err(BlockError::InvalidState("block not completed".into())),
            State::Poisoned => Err(BlockError::Poisoned),
        }
    }
}

/// Read-only artifacts of a finished block
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedBlock {
    /// Final block meta
    pub meta: BlockMeta,
    /// Bloom filter over every written id
    pub bloom: BloomFilter,
    /// Sparse index records in write order
    pub records: Records,
    /// Data file location, for file backed blocks
    pub data_path: Option<PathBuf>,
}

impl CompletedBlock {
    /// Locate the run that may hold `id`, consulting the bloom filter first
    pub fn find(&self, id: &Id) -> Option<&IndexRecord> {
        if !self.bloom.test(id.as_bytes()) || !self.meta.may_contain_id(id) {
            return None;
        }
        self.records.find(id)
    }

    /// Write meta, bloom filter and index into `dir`
    pub fn persist(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        std::fs::write(dir.join(META_FILE), self.meta.to_json()?)?;
        std::fs::write(dir.join(BLOOM_FILE), self.bloom.to_bytes())?;
        std::fs::write(dir.join(INDEX_FILE), self.records.encode()?)?;

        debug!(dir = %dir.display(), block_id = %self.meta.block_id, "Persisted block artifacts");
        Ok(())
    }

    /// Read artifacts written by [`CompletedBlock::persist`]
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let meta = BlockMeta::from_json(&std::fs::read(dir.join(META_FILE))?)?;
        let bloom = BloomFilter::from_bytes(&std::fs::read(dir.join(BLOOM_FILE))?)?;
        let records = Records::decode(&std::fs::read(dir.join(INDEX_FILE))?)?;

        Ok(Self {
            meta,
            bloom,
            records,
            data_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MemoryStore, ObjectIter};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use rand::{Rng, RngCore};
    use tempfile::TempDir;

    const TENANT: &str = "fake";

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn source_metas() -> Vec<BlockMeta> {
        vec![
            BlockMeta::new(Uuid::new_v4(), TENANT, ts(10000), ts(20000)),
            BlockMeta::new(Uuid::new_v4(), TENANT, ts(15000), ts(25000)),
        ]
    }

    fn memory_block(downsample: usize) -> CompactorBlock<MemoryStore> {
        CompactorBlock::with_store(
            MemoryStore::new(),
            Uuid::new_v4(),
            TENANT,
            &source_metas(),
            100,
            downsample,
            0.01,
        )
        .unwrap()
    }

    fn store_block(store: MemoryStore) -> CompactorBlock<MemoryStore> {
        CompactorBlock::with_store(store, Uuid::new_v4(), TENANT, &source_metas(), 10, 3, 0.01)
            .unwrap()
    }

    fn random_id(rng: &mut impl RngCore) -> Vec<u8> {
        let mut id = vec![0u8; 16];
        rng.fill_bytes(&mut id);
        id
    }

    fn assert_empty_dir(dir: &Path) {
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_destination_rejected() {
        let result = CompactorBlock::new(Uuid::new_v4(), "", TENANT, &source_metas(), 10, 3, 0.01);
        assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
    }

    #[test]
    fn test_invalid_arguments_touch_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let metas = source_metas();

        let cases: Vec<Result<CompactorBlock>> = vec![
            CompactorBlock::new(Uuid::nil(), dir, TENANT, &metas, 10, 3, 0.01),
            CompactorBlock::new(Uuid::new_v4(), dir, "", &metas, 10, 3, 0.01),
            CompactorBlock::new(Uuid::new_v4(), dir, "a/b", &metas, 10, 3, 0.01),
            CompactorBlock::new(Uuid::new_v4(), dir, TENANT, &[], 10, 3, 0.01),
            CompactorBlock::new(Uuid::new_v4(), dir, TENANT, &metas, 0, 3, 0.01),
            CompactorBlock::new(Uuid::new_v4(), dir, TENANT, &metas, 10, 0, 0.01),
            CompactorBlock::new(Uuid::new_v4(), dir, TENANT, &metas, 10, 3, 0.0),
            CompactorBlock::new(Uuid::new_v4(), dir, TENANT, &metas, 10, 3, 1.5),
        ];

        for result in cases {
            assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
        }
        assert_empty_dir(dir);
    }

    #[test]
    fn test_invalid_store_arguments_touch_nothing() {
        let store = MemoryStore::new();
        let result = CompactorBlock::with_store(
            store.clone(),
            Uuid::new_v4(),
            "",
            &source_metas(),
            10,
            3,
            0.01,
        );

        assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_oversized_expected_count_rejected() {
        let store = MemoryStore::new();
        let result = CompactorBlock::with_store(
            store.clone(),
            Uuid::new_v4(),
            TENANT,
            &source_metas(),
            usize::MAX,
            3,
            0.01,
        );

        assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_compactor_block_write() {
        let temp_dir = TempDir::new().unwrap();
        let mut rng = rand::thread_rng();
        let num_objects = 7;

        let block_id = Uuid::new_v4();
        let mut block = CompactorBlock::new(
            block_id,
            temp_dir.path(),
            TENANT,
            &source_metas(),
            num_objects,
            3,
            0.01,
        )
        .unwrap();

        let mut ids = Vec::new();
        let mut payloads = Vec::new();
        for _ in 0..num_objects {
            let id = random_id(&mut rng);
            let mut payload = vec![0u8; rng.gen_range(0..1024)];
            rng.fill_bytes(&mut payload);

            block.write(&id, &payload).unwrap();
            ids.push(id);
            payloads.push(payload);
        }
        block.complete().unwrap();

        assert_eq!(block.length(), num_objects);

        let meta = block.block_meta();
        assert_eq!(meta.block_id, block_id);
        assert_eq!(meta.tenant_id, TENANT);
        assert_eq!(meta.start_time, ts(10000));
        assert_eq!(meta.end_time, ts(25000));
        assert_eq!(meta.total_objects, num_objects);

        let min = ids.iter().min().unwrap();
        let max = ids.iter().max().unwrap();
        assert_eq!(meta.min_id.as_ref().unwrap().as_bytes(), min.as_slice());
        assert_eq!(meta.max_id.as_ref().unwrap().as_bytes(), max.as_slice());

        for id in &ids {
            assert!(block.bloom_filter().test(id));
        }

        assert_eq!(block.records().len(), 3);

        // Data file holds every object in write order
        let path = temp_dir.path().join(format!("{}:{}", block_id, TENANT));
        assert_eq!(block.data_path(), Some(path.as_path()));
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, block.bytes_written());

        let objects: Vec<_> = ObjectIter::new(&data).collect::<Result<_>>().unwrap();
        assert_eq!(objects.len(), num_objects);
        for (i, (id, payload)) in objects.iter().enumerate() {
            assert_eq!(id.as_bytes(), ids[i].as_slice());
            assert_eq!(&payload[..], payloads[i].as_slice());
        }
    }

    #[test]
    fn test_no_writes() {
        let mut block = memory_block(3);
        block.complete().unwrap();

        assert_eq!(block.length(), 0);
        assert!(block.records().is_empty());
        assert!(block.block_meta().min_id.is_none());
        assert!(block.block_meta().max_id.is_none());
        assert_eq!(block.block_meta().start_time, ts(10000));
        assert_eq!(block.block_meta().end_time, ts(25000));
    }

    #[test]
    fn test_count_and_record_invariants() {
        let downsample = 5;
        let mut rng = rand::thread_rng();

        for n in [0, 1, downsample - 1, downsample, downsample + 1, 2 * downsample, 1000] {
            let mut block = memory_block(downsample);
            for _ in 0..n {
                block.write(&random_id(&mut rng), b"obj").unwrap();
            }
            block.complete().unwrap();

            assert_eq!(block.length(), n);
            assert_eq!(block.block_meta().total_objects, n);
            assert_eq!(block.records().len(), (n + downsample - 1) / downsample, "n = {}", n);
        }
    }

    #[test]
    fn test_records_cover_store_bytes() {
        let store = MemoryStore::new();
        let mut block = store_block(store.clone());

        for i in 0..10u8 {
            block.write(&[i; 16], &vec![i; i as usize * 3]).unwrap();
        }
        block.complete().unwrap();

        let data = store.contents();
        assert_eq!(store.flushed_len(), data.len());

        let mut expected_offset = 0;
        for record in block.records() {
            assert_eq!(record.start_offset, expected_offset);
            expected_offset += record.length;

            let start = record.start_offset as usize;
            let end = start + record.length as usize;
            for object in ObjectIter::new(&data[start..end]) {
                let (id, _) = object.unwrap();
                assert!(record.contains(&id));
            }
        }
        assert_eq!(expected_offset, data.len() as u64);

        let last = block.records().get(3).unwrap();
        assert_eq!(last.min_id.as_bytes(), &[9u8; 16]);
        assert_eq!(last.max_id.as_bytes(), &[9u8; 16]);
    }

    #[test]
    fn test_sorted_input_is_searchable() {
        let mut block = memory_block(4);
        let mut ids: Vec<Vec<u8>> = (0..50u32).map(|i| (i * 3).to_be_bytes().to_vec()).collect();
        ids.sort();

        for id in &ids {
            block.write(id, b"span").unwrap();
        }
        block.complete().unwrap();
        assert!(block.written_in_order());

        let completed = block.into_completed().unwrap();
        for id in &ids {
            let id = Id::from_slice(id).unwrap();
            let record = completed.find(&id).unwrap();
            assert!(record.contains(&id));
        }

        let missing = Id::from_slice(&1000u32.to_be_bytes()).unwrap();
        assert!(completed.find(&missing).is_none());
    }

    #[test]
    fn test_out_of_order_detected() {
        let mut block = memory_block(4);
        block.write(&[2], b"").unwrap();
        block.write(&[1], b"").unwrap();
        assert!(!block.written_in_order());
    }

    #[test]
    fn test_equal_ids_keep_bounds() {
        let mut block = memory_block(2);
        block.write(&[5; 16], b"a").unwrap();
        block.write(&[5; 16], b"b").unwrap();
        block.complete().unwrap();

        let meta = block.block_meta();
        assert_eq!(meta.min_id, meta.max_id);
        assert_eq!(meta.total_objects, 2);
        assert_eq!(block.records().len(), 1);
    }

    #[test]
    fn test_malformed_id_rejected() {
        let mut block = memory_block(3);

        let result = block.write(&[], b"payload");
        assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
        assert_eq!(block.length(), 0);
        assert!(block.is_poisoned());
        assert!(block.store().is_empty());
    }

    #[test]
    fn test_append_failure_poisons() {
        let store = MemoryStore::new();
        store.fail_appends_after(2);
        let mut block = store_block(store.clone());

        block.write(&[1; 16], b"a").unwrap();
        block.write(&[2; 16], b"b").unwrap();

        let err = block.write(&[3; 16], b"c").unwrap_err();
        assert!(matches!(err, BlockError::Io(_)));
        assert_eq!(block.length(), 2);
        assert!(block.is_poisoned());

        assert!(matches!(block.write(&[4; 16], b"d"), Err(BlockError::Poisoned)));
        assert!(matches!(block.complete(), Err(BlockError::Poisoned)));
        assert!(matches!(block.into_completed(), Err(BlockError::Poisoned)));
    }

    #[test]
    fn test_flush_failure_poisons() {
        let store = MemoryStore::new();
        store.fail_flushes();
        let mut block = store_block(store);

        block.write(&[1; 16], b"a").unwrap();
        assert!(matches!(block.complete(), Err(BlockError::Io(_))));
        assert!(block.is_poisoned());
        assert!(!block.is_completed());
    }

    #[test]
    fn test_write_after_complete() {
        let mut block = memory_block(3);
        block.write(&[1; 16], b"a").unwrap();
        block.complete().unwrap();

        assert!(matches!(block.write(&[2; 16], b"b"), Err(BlockError::InvalidState(_))));
        assert!(matches!(block.complete(), Err(BlockError::InvalidState(_))));
        assert_eq!(block.length(), 1);
        assert_eq!(block.records().len(), 1);
    }

    #[test]
    fn test_into_completed_requires_complete() {
        let block = memory_block(3);
        assert!(matches!(block.into_completed(), Err(BlockError::InvalidState(_))));
    }

    #[test]
    fn test_clear_removes_data_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut block = CompactorBlock::new(
            Uuid::new_v4(),
            temp_dir.path(),
            TENANT,
            &source_metas(),
            10,
            3,
            0.01,
        )
        .unwrap();
        block.write(&[1; 16], b"a").unwrap();

        let path = block.data_path().unwrap().to_path_buf();
        assert!(path.exists());

        block.clear().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut block = memory_block(3);
        for i in 0..8u8 {
            block.write(&[i; 16], b"payload").unwrap();
        }
        block.complete().unwrap();

        let completed = block.into_completed().unwrap();
        let dir = temp_dir.path().join("block");
        completed.persist(&dir).unwrap();

        let loaded = CompletedBlock::load(&dir).unwrap();
        assert_eq!(loaded.meta, completed.meta);
        assert_eq!(loaded.bloom, completed.bloom);
        assert_eq!(loaded.records, completed.records);
        assert_eq!(loaded.records.len(), 3);
    }

    proptest! {
        #[test]
        fn test_bounds_match_written_ids(
            ids in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..=16), 0..200),
            downsample in 1usize..20
        ) {
            let mut block = memory_block(downsample);
            for id in &ids {
                block.write(id, id).unwrap();
            }
            block.complete().unwrap();

            let meta = block.block_meta();
            prop_assert_eq!(block.length(), ids.len());
            prop_assert_eq!(block.records().len(), (ids.len() + downsample - 1) / downsample);
            prop_assert_eq!(
                meta.min_id.as_ref().map(|id| id.as_bytes().to_vec()),
                ids.iter().min().cloned()
            );
            prop_assert_eq!(
                meta.max_id.as_ref().map(|id| id.as_bytes().to_vec()),
                ids.iter().max().cloned()
            );
            for id in &ids {
                prop_assert!(block.bloom_filter().test(id));
            }
        }
    }
}
