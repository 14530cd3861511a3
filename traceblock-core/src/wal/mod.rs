//! Write-Ahead Log (WAL) compaction entry point
//!
//! The WAL owns the directory compacted blocks are written into and the
//! per-block index and bloom settings. Compaction jobs ask it for a
//! [`CompactorBlock`] and stream merged objects into it.

use crate::block::{BlockMeta, CompactorBlock};
use crate::{BlockError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// WAL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory for WAL and compacted block files
    pub filepath: PathBuf,
    /// Objects per sparse index record
    pub index_downsample: usize,
    /// Target bloom filter false positive rate
    pub bloom_fp: f64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            filepath: PathBuf::from("data/wal"),
            index_downsample: crate::config::DEFAULT_INDEX_DOWNSAMPLE,
            bloom_fp: crate::config::DEFAULT_BLOOM_FP,
        }
    }
}

impl WalConfig {
    /// Check the configuration without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        if self.filepath.as_os_str().is_empty() {
            return Err(BlockError::InvalidArgument(
                "please provide a path for the WAL".into(),
            ));
        }
        if self.index_downsample == 0 {
            return Err(BlockError::InvalidArgument(
                "index downsample must be at least 1".into(),
            ));
        }
        if !(self.bloom_fp > 0.0 && self.bloom_fp < 1.0) {
            return Err(BlockError::InvalidArgument(format!(
                "bloom false positive rate must be in (0, 1), got {}",
                self.bloom_fp
            )));
        }
        Ok(())
    }

    /// Parse a JSON configuration, filling missing fields with defaults
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }
}

/// WAL handle producing compacted blocks
#[derive(Debug)]
pub struct Wal {
    config: WalConfig,
    completed_dir: PathBuf,
}

impl Wal {
    /// Validate the config and create the WAL directories
    pub fn new(config: WalConfig) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.filepath)?;
        let completed_dir = config.filepath.join(crate::config::COMPLETED_DIR);
        fs::create_dir_all(&completed_dir)?;

        info!(
            path = %config.filepath.display(),
            index_downsample = config.index_downsample,
            bloom_fp = config.bloom_fp,
            "Opened WAL"
        );

        Ok(Self {
            config,
            completed_dir,
        })
    }

    /// Start a compacted block for `tenant_id` merged from `metas`
    pub fn new_compactor_block(
        &self,
        block_id: Uuid,
        tenant_id: &str,
        metas: &[BlockMeta],
        estimated_objects: usize,
    ) -> Result<CompactorBlock> {
        CompactorBlock::new(
            block_id,
            &self.config.filepath,
            tenant_id,
            metas,
            estimated_objects,
            self.config.index_downsample,
            self.config.bloom_fp,
        )
    }

    /// Directory where finished blocks are persisted
    pub fn completed_dir(&self) -> &Path {
        &self.completed_dir
    }
}
