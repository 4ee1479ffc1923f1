//! Segment log writer

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    list_segments, segment_path, Compression, LogConfig, SyncPolicy, FLAG_COMPRESSED,
    FRAME_HEADER_LEN,
};
use crate::error::{Result, WalError};

/// Handle to one append-only segment log directory
pub struct SegmentLog {
    dir: PathBuf,
    config: LogConfig,
    inner: Mutex<SegmentLogInner>,
}

struct SegmentLogInner {
    file: BufWriter<File>,
    index: u64,
    bytes_written: usize,
    writes_since_sync: usize,
}

impl SegmentLog {
    /// Open the log at `dir`, creating the directory if needed.
    ///
    /// Writing always starts on a fresh segment after the highest existing
    /// index: the tail of the previous active segment may be torn from a
    /// crash and is only ever read, never appended to again.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index = match list_segments(&dir)?.last() {
            Some((last, _)) => last + 1,
            None => 0,
        };
        let file = open_segment(&dir, index)?;

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(SegmentLogInner {
                file: BufWriter::new(file),
                index,
                bytes_written: 0,
                writes_since_sync: 0,
            }),
        })
    }

    /// Directory the log lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Active configuration
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Append one record, rotating first if the active segment is full
    pub fn log(&self, record: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + record.len());
        match self.config.compression {
            Compression::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(record);
                frame.put_u32_le(compressed.len() as u32);
                frame.put_u8(FLAG_COMPRESSED);
                frame.put_u32_le(crc32fast::hash(&compressed));
                frame.put_slice(&compressed);
            }
            Compression::None => {
                frame.put_u32_le(record.len() as u32);
                frame.put_u8(0);
                frame.put_u32_le(crc32fast::hash(record));
                frame.put_slice(record);
            }
        }

        let mut inner = self.inner.lock();

        // Oversized records are still written, alone, after a rotation.
        if inner.bytes_written > 0 && inner.bytes_written + frame.len() > self.config.segment_size {
            self.rotate(&mut inner)?;
        }

        inner.file.write_all(&frame)?;
        inner.bytes_written += frame.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            inner.file.flush()?;
            inner.file.get_ref().sync_all()?;
            inner.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Finish the active segment and start a new one
    pub fn next_segment(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.rotate(&mut inner)
    }

    /// First and last segment index on disk, if any segments exist
    pub fn segments_range(&self) -> Result<Option<(u64, u64)>> {
        let segments = list_segments(&self.dir)?;
        match (segments.first(), segments.last()) {
            (Some((first, _)), Some((last, _))) => Ok(Some((*first, *last))),
            _ => Ok(None),
        }
    }

    /// Delete segments with an index below `up_to`, never the active one.
    ///
    /// All candidates are attempted; the first error (if any) is returned.
    pub fn truncate(&self, up_to: u64) -> Result<()> {
        let active = self.inner.lock().index;
        let mut first_err = None;

        for (index, path) in list_segments(&self.dir)? {
            if index >= up_to || index == active {
                continue;
            }
            debug!("removing segment {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Recover from a corruption error reported by a reader of this log.
    ///
    /// Keeps the valid prefix of the corrupt segment, drops every segment
    /// after it, and resumes writing on a fresh segment.
    pub fn repair(&self, err: &WalError) -> Result<()> {
        let (segment, offset) = match err {
            WalError::Corruption {
                dir,
                segment,
                offset,
                ..
            } if *dir == self.dir => (*segment, *offset),
            _ => {
                return Err(WalError::Repair(format!("cannot handle error: {}", err)));
            }
        };

        warn!(
            "rewriting corrupted segment {} at offset {}",
            segment, offset
        );

        let mut inner = self.inner.lock();

        // Records past the corruption are unreachable on replay; drop the
        // segments holding them.
        for (index, path) in list_segments(&self.dir)? {
            if index <= segment {
                continue;
            }
            fs::remove_file(&path)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .open(segment_path(&self.dir, segment))?;
        file.set_len(offset)?;
        file.sync_all()?;

        let index = segment + 1;
        inner.file = BufWriter::new(open_segment(&self.dir, index)?);
        inner.index = index;
        inner.bytes_written = 0;
        inner.writes_since_sync = 0;

        Ok(())
    }

    /// Flush buffered writes and sync the active segment to disk
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        Ok(())
    }

    fn should_sync(&self, inner: &SegmentLogInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::None => false,
        }
    }

    fn rotate(&self, inner: &mut SegmentLogInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;

        inner.index += 1;
        inner.file = BufWriter::new(open_segment(&self.dir, inner.index)?);
        inner.bytes_written = 0;
        inner.writes_since_sync = 0;

        Ok(())
    }
}

fn open_segment(dir: &Path, index: u64) -> Result<File> {
    let path = segment_path(dir, index);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(WalError::Io)
}
