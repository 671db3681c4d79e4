//! Append log configuration.
//!
//! ```toml
//! [log]
//! throughput_hint = "4MB"   # bytes per minute
//! min_block_size = "64KB"
//! max_block_size = "16MB"
//! archive_path = "/var/lib/store/archive"
//! archive_map_size = "1GB"
//! ```

use crate::block::{HEADER_SIZE, frame_len};
use crate::error::Result;
use serde::Deserialize;
use std::path::PathBuf;
use store_core::{StoreError, deserialize_size};

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Configuration for append logs and the block archive.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Expected bytes appended per minute; new blocks hold about a minute.
    #[serde(
        default = "default_throughput_hint",
        deserialize_with = "deserialize_size"
    )]
    pub throughput_hint: usize,

    /// Smallest block rented on rotation.
    #[serde(
        default = "default_min_block_size",
        deserialize_with = "deserialize_size"
    )]
    pub min_block_size: usize,

    /// Largest block rented on rotation, unless one entry needs more.
    #[serde(
        default = "default_max_block_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_block_size: usize,

    /// Directory of the block archive.
    #[serde(default = "default_archive_path")]
    pub archive_path: PathBuf,

    /// LMDB map size for the block archive.
    #[serde(
        default = "default_archive_map_size",
        deserialize_with = "deserialize_size"
    )]
    pub archive_map_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            throughput_hint: default_throughput_hint(),
            min_block_size: default_min_block_size(),
            max_block_size: default_max_block_size(),
            archive_path: default_archive_path(),
            archive_map_size: default_archive_map_size(),
        }
    }
}

impl LogConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_block_size <= HEADER_SIZE {
            return Err(StoreError::Config(format!(
                "min_block_size must exceed the {HEADER_SIZE} byte block header"
            ))
            .into());
        }

        if self.min_block_size > self.max_block_size {
            return Err(StoreError::Config(format!(
                "min_block_size ({}) exceeds max_block_size ({})",
                self.min_block_size, self.max_block_size
            ))
            .into());
        }

        if self.archive_map_size == 0 || self.archive_map_size % (4 * KB) != 0 {
            return Err(StoreError::Config(
                "archive_map_size must be a non-zero multiple of 4KB".into(),
            )
            .into());
        }

        Ok(())
    }

    /// Buffer size to rent for a new block given the throughput hint.
    ///
    /// Always large enough for the header plus one entry of `entry_len`.
    pub fn block_size(&self, throughput_hint: usize, entry_len: usize) -> usize {
        throughput_hint
            .clamp(self.min_block_size, self.max_block_size)
            .max(frame_len(entry_len).saturating_add(HEADER_SIZE))
    }
}

fn default_throughput_hint() -> usize {
    MB
}

fn default_min_block_size() -> usize {
    64 * KB
}

fn default_max_block_size() -> usize {
    16 * MB
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("archive")
}

fn default_archive_map_size() -> usize {
    GB
}
