//! Durable archive of completed blocks.
//!
//! Completed blocks are copied into an LMDB table keyed by
//! `(stream_id, first_version)`, so the blocks of one stream are contiguous
//! and ordered by version.
//!
//! # Record Layout
//!
//! ```text
//! key:   stream_id (sign-flipped, u64 BE) ++ first_version (u64 BE)
//! value: count (u32 LE) | value_size (i16 LE) | reserved (2B) | frames
//! ```

use crate::block::AppendBlock;
use crate::config::LogConfig;
use crate::cursor::Frames;
use crate::error::{LogError, Result};
use crate::log::BlockSink;
use crate::metrics::BLOCKS_ARCHIVED;
use crate::retired::RetiredBlocks;
use heed::byteorder::BigEndian;
use heed::types::{Bytes, U128};
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{debug, info, warn};

const RECORD_HEADER: usize = 8;
const SIGN: u64 = 1 << 63;

fn block_key(stream_id: i64, first_version: u64) -> u128 {
    ((((stream_id as u64) ^ SIGN) as u128) << 64) | first_version as u128
}

fn split_key(key: u128) -> (i64, u64) {
    ((((key >> 64) as u64) ^ SIGN) as i64, key as u64)
}

fn stream_keys(stream_id: i64) -> RangeInclusive<u128> {
    block_key(stream_id, 0)..=block_key(stream_id, u64::MAX)
}

/// A completed block read back from the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedBlock {
    /// Stream the block belongs to.
    pub stream_id: i64,
    /// Version of the first entry.
    pub first_version: u64,
    /// Number of entries.
    pub count: u32,
    /// Value size recorded for the stream.
    pub value_size: i16,
    /// Entry frames.
    pub data: Vec<u8>,
}

impl ArchivedBlock {
    /// Version after the last entry.
    pub fn next_version(&self) -> u64 {
        self.first_version + self.count as u64
    }

    /// Version of the last entry, if any.
    pub fn last_version(&self) -> Option<u64> {
        self.next_version().checked_sub(1).filter(|_| self.count > 0)
    }

    /// Iterate entries as `(version, payload)`.
    pub fn frames(&self) -> Frames<'_> {
        Frames::new(&self.data, self.first_version, self.count)
    }

    fn encode(block: &AppendBlock) -> Result<Vec<u8>> {
        let data = block.committed_bytes()?;
        let mut record = Vec::with_capacity(RECORD_HEADER + data.len());
        record.extend_from_slice(&block.len().to_le_bytes());
        record.extend_from_slice(&block.value_size().to_le_bytes());
        record.extend_from_slice(&[0u8; 2]);
        record.extend_from_slice(data);
        Ok(record)
    }

    fn decode(key: u128, record: &[u8]) -> Result<Self> {
        if record.len() < RECORD_HEADER {
            return Err(LogError::Corrupted("archive record too short"));
        }

        let (stream_id, first_version) = split_key(key);
        let count = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let value_size = i16::from_le_bytes([record[4], record[5]]);

        Ok(Self {
            stream_id,
            first_version,
            count,
            value_size,
            data: record[RECORD_HEADER..].to_vec(),
        })
    }
}

/// LMDB-backed store of completed blocks.
///
/// As a [`BlockSink`] the archive copies each block and returns its buffer
/// to the pool. Blocks that readers still retain are kept until
/// [`reap`](Self::reap) finds them unshared. Blocks whose write failed are
/// held and written again, in order, before the next accepted block.
pub struct BlockArchive {
    env: Env,
    blocks: Database<U128<BigEndian>, Bytes>,
    retired: RetiredBlocks,
    unarchived: Mutex<Vec<AppendBlock>>,
}

impl BlockArchive {
    /// Open or create an archive at `path`.
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path)?
        };

        let mut txn = env.write_txn()?;
        let blocks = env.create_database::<U128<BigEndian>, Bytes>(&mut txn, Some("blocks"))?;
        txn.commit()?;

        let archive = Self {
            env,
            blocks,
            retired: RetiredBlocks::new(),
            unarchived: Mutex::new(Vec::new()),
        };

        info!(path = %path.display(), blocks = archive.len()?, "opened block archive");
        Ok(archive)
    }

    /// Open the archive described by `config`.
    pub fn from_config(config: &LogConfig) -> Result<Self> {
        Self::open(&config.archive_path, config.archive_map_size)
    }

    /// Copy the committed contents of `block` into the archive.
    pub fn put(&self, block: &AppendBlock) -> Result<()> {
        let record = ArchivedBlock::encode(block)?;
        let key = block_key(block.stream_id(), block.first_version());

        let mut txn = self.env.write_txn()?;
        self.blocks.put(&mut txn, &key, &record)?;
        txn.commit()?;

        BLOCKS_ARCHIVED.increment();
        debug!(
            stream_id = block.stream_id(),
            first_version = block.first_version(),
            entries = block.len(),
            bytes = record.len(),
            "archived block"
        );
        Ok(())
    }

    /// Read the block of `stream_id` starting at `first_version`.
    pub fn get(&self, stream_id: i64, first_version: u64) -> Result<Option<ArchivedBlock>> {
        let key = block_key(stream_id, first_version);
        let txn = self.env.read_txn()?;
        match self.blocks.get(&txn, &key)? {
            Some(record) => Ok(Some(ArchivedBlock::decode(key, record)?)),
            None => Ok(None),
        }
    }

    /// Read the blocks of `stream_id` holding any version in `versions`.
    pub fn range(&self, stream_id: i64, versions: RangeInclusive<u64>) -> Result<Vec<ArchivedBlock>> {
        let (lo, hi) = (*versions.start(), *versions.end());
        if lo > hi {
            return Ok(Vec::new());
        }

        let txn = self.env.read_txn()?;

        // the block holding `lo` may start before it
        let lo_key = block_key(stream_id, lo);
        let start = self
            .blocks
            .rev_range(&txn, &(block_key(stream_id, 0)..=lo_key))?
            .next()
            .transpose()?
            .map_or(lo_key, |(key, _)| key);

        let mut blocks = Vec::new();
        for item in self.blocks.range(&txn, &(start..=block_key(stream_id, hi)))? {
            let (key, record) = item?;
            let block = ArchivedBlock::decode(key, record)?;
            if block.next_version() > lo {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Version after the last archived entry of `stream_id`.
    pub fn next_version(&self, stream_id: i64) -> Result<Option<u64>> {
        let txn = self.env.read_txn()?;
        let last = self
            .blocks
            .rev_range(&txn, &stream_keys(stream_id))?
            .next()
            .transpose()?;

        match last {
            Some((key, record)) => Ok(Some(ArchivedBlock::decode(key, record)?.next_version())),
            None => Ok(None),
        }
    }

    /// Distinct streams with archived blocks.
    pub fn streams(&self) -> Result<Vec<i64>> {
        let txn = self.env.read_txn()?;
        let mut streams: Vec<i64> = Vec::new();
        for item in self.blocks.iter(&txn)? {
            let (key, _) = item?;
            let (stream_id, _) = split_key(key);
            if streams.last() != Some(&stream_id) {
                streams.push(stream_id);
            }
        }
        Ok(streams)
    }

    /// Number of archived blocks.
    pub fn len(&self) -> Result<u64> {
        let txn = self.env.read_txn()?;
        Ok(self.blocks.len(&txn)?)
    }

    /// Check for an empty archive.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Blocks archived but still waiting for readers to detach.
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Blocks whose write failed and that wait for the next accept.
    pub fn unarchived(&self) -> usize {
        self.unarchived.lock().len()
    }

    /// Write held blocks, oldest first, stopping at the first failure.
    fn flush_unarchived(&self) -> Result<()> {
        let mut held = self.unarchived.lock();
        while let Some(block) = held.first() {
            self.put(block)?;
            let block = held.remove(0);
            self.retired.dispose_or_retire(block)?;
        }
        Ok(())
    }

    /// Return the buffers of archived blocks that no reader retains.
    ///
    /// Returns the number of blocks freed.
    pub fn reap(&self) -> Result<usize> {
        self.retired.reap()
    }
}

impl BlockSink for BlockArchive {
    fn accept(&self, block: AppendBlock) -> Result<()> {
        block.complete();

        let written = self.flush_unarchived().and_then(|()| self.put(&block));
        if let Err(e) = written {
            warn!(
                stream_id = block.stream_id(),
                first_version = block.first_version(),
                error = %e,
                "holding block after failed archive write"
            );
            self.unarchived.lock().push(block);
            return Err(e);
        }

        if !self.retired.is_empty() {
            self.retired.reap()?;
        }
        self.retired.dispose_or_retire(block)
    }
}
