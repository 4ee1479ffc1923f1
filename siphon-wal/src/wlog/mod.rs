//! Append-only segment log
//!
//! The log is a directory of numbered segment files plus checkpoint
//! sub-directories. Writers append framed records to the active segment and
//! rotate when it fills; checkpoints compact the still-relevant records of
//! older segments so those segments can be deleted without losing series
//! declarations. Each frame is a length prefix, a flags byte, a CRC32 of the
//! payload, and the (optionally lz4-compressed) payload itself.

mod checkpoint;
mod reader;
mod writer;

pub use checkpoint::{checkpoint, delete_checkpoints, last_checkpoint};
pub use reader::{read_all_records, RecordIter};
pub use writer::SegmentLog;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Bytes in a frame header: payload length (4), flags (1), CRC32 (4)
pub(crate) const FRAME_HEADER_LEN: usize = 9;

/// Frame flag: payload is lz4 block-compressed
pub(crate) const FLAG_COMPRESSED: u8 = 1;

/// Compression applied to record payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Store payloads as written
    None,
    /// lz4 block compression per record
    Lz4,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Lz4
    }
}

/// Log sync policy
#[derive(Debug, Clone, Copy)]
pub enum SyncPolicy {
    /// Sync after every record (safest, slowest)
    Immediate,
    /// Sync after N records
    EveryN(usize),
    /// Never sync explicitly; rotation and close still flush
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// Segment log configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum segment size in bytes before rotation
    pub segment_size: usize,
    /// Payload compression
    pub compression: Compression,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size: crate::config::WAL_SEGMENT_SIZE,
            compression: Compression::default(),
            sync_policy: SyncPolicy::default(),
        }
    }
}

pub(crate) fn segment_file_name(index: u64) -> String {
    format!("{:08}.wal", index)
}

pub(crate) fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(segment_file_name(index))
}

pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".wal")?.parse().ok()
}

pub(crate) fn checkpoint_dir_name(index: u64) -> String {
    format!("checkpoint_{:08}", index)
}

pub(crate) fn parse_checkpoint_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix("checkpoint_")?.parse().ok()
}

/// List segment files in a directory, sorted by index
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(index) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name)
        {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}
