//! Store configuration.
//!
//! Sizes accept either a plain byte count or a string with a unit suffix:
//!
//! ```toml
//! [store]
//! path = "/var/lib/store"
//! page_size = "4KB"
//! max_total_size = "8GB"
//! pow2_threshold = "64KB"
//! segment_size = "1MB"
//! ```

use crate::error::{Result, StoreError};
use crate::reference::MAX_BUCKET_CLASS;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Smallest page size accepted (the OS page on common platforms).
pub const MIN_PAGE_SIZE: usize = 4 * KB;

/// Configuration for the bucket store, allocator, and pool.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding the allocation index and bucket files.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Page size; class 0 buffers are one page.
    #[serde(default = "default_page_size", deserialize_with = "deserialize_size")]
    pub page_size: usize,

    /// Upper bound on bytes reserved across all bucket classes.
    #[serde(
        default = "default_max_total_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_total_size: usize,

    /// Requests above this length are rounded to a power of two.
    #[serde(
        default = "default_pow2_threshold",
        deserialize_with = "deserialize_size"
    )]
    pub pow2_threshold: usize,

    /// Granularity of memory-mapped growth per class.
    #[serde(default = "default_segment_size", deserialize_with = "deserialize_size")]
    pub segment_size: usize,

    /// Largest bucket class the store will serve.
    #[serde(default = "default_max_bucket_class")]
    pub max_bucket_class: u8,

    /// LMDB map size for the allocation index.
    #[serde(
        default = "default_index_map_size",
        deserialize_with = "deserialize_size"
    )]
    pub index_map_size: usize,

    /// Writer-process identity. Defaults to the OS process id.
    #[serde(default)]
    pub wpid: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            page_size: default_page_size(),
            max_total_size: default_max_total_size(),
            pow2_threshold: default_pow2_threshold(),
            segment_size: default_segment_size(),
            max_bucket_class: default_max_bucket_class(),
            index_map_size: default_index_map_size(),
            wpid: None,
        }
    }
}

impl StoreConfig {
    /// Create a config rooted at `path` with default sizes.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Effective writer-process identity.
    pub fn wpid(&self) -> u64 {
        self.wpid.unwrap_or_else(|| std::process::id() as u64)
    }

    /// Directory of the durable allocation index.
    pub fn index_path(&self) -> PathBuf {
        self.path.join("index")
    }

    /// Directory of the memory-mapped bucket files.
    pub fn buckets_path(&self) -> PathBuf {
        self.path.join("buckets")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(StoreError::Config(format!(
                "page_size ({}) must be a power of two >= {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }

        if self.segment_size < self.page_size || self.segment_size % self.page_size != 0 {
            return Err(StoreError::Config(format!(
                "segment_size ({}) must be a multiple of page_size ({})",
                self.segment_size, self.page_size
            )));
        }

        if self.max_bucket_class > MAX_BUCKET_CLASS {
            return Err(StoreError::Config(format!(
                "max_bucket_class ({}) must be <= {}",
                self.max_bucket_class, MAX_BUCKET_CLASS
            )));
        }

        if (self.page_size as u128) << self.max_bucket_class > u32::MAX as u128 + 1 {
            return Err(StoreError::Config(format!(
                "bucket class {} exceeds 4GB with page_size {}",
                self.max_bucket_class, self.page_size
            )));
        }

        if self.max_total_size < self.page_size {
            return Err(StoreError::Config(format!(
                "max_total_size ({}) must be at least page_size ({})",
                self.max_total_size, self.page_size
            )));
        }

        if self.index_map_size == 0 || self.index_map_size % MIN_PAGE_SIZE != 0 {
            return Err(StoreError::Config(format!(
                "index_map_size ({}) must be a non-zero multiple of {}",
                self.index_map_size, MIN_PAGE_SIZE
            )));
        }

        Ok(())
    }
}

fn default_path() -> PathBuf {
    Path::new("data").to_path_buf()
}

fn default_page_size() -> usize {
    4 * KB
}

fn default_max_total_size() -> usize {
    GB
}

fn default_pow2_threshold() -> usize {
    64 * KB
}

fn default_segment_size() -> usize {
    MB
}

fn default_max_bucket_class() -> u8 {
    16
}

fn default_index_map_size() -> usize {
    64 * MB
}

/// Deserialize a size given as an integer or a string such as `"64MB"`.
pub fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB", "4GB", "1TB" into bytes.
pub fn parse_size(s: &str) -> std::result::Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KB,
        "M" | "MB" | "MIB" => MB,
        "G" | "GB" | "GIB" => GB,
        "T" | "TB" | "TIB" => 1024 * GB,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}
