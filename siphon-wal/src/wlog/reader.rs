//! Segment reader for replay

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Buf;

use super::{segment_path, FLAG_COMPRESSED, FRAME_HEADER_LEN};
use crate::error::{Result, WalError};

/// Iterator over the records of one segment file.
///
/// A clean end of file and a torn tail frame (crash mid-write) both end
/// iteration with `Ok(None)`. Anything else wrong with a frame is
/// reported as a corruption positioned at the start of that frame.
pub struct RecordIter {
    dir: PathBuf,
    segment: u64,
    data: Vec<u8>,
    offset: usize,
    record_start: usize,
}

impl RecordIter {
    /// Open segment `segment` under `dir` for reading
    pub fn open(dir: impl Into<PathBuf>, segment: u64) -> Result<Self> {
        let dir = dir.into();
        let mut file = File::open(segment_path(&dir, segment))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        Ok(Self {
            dir,
            segment,
            data,
            offset: 0,
            record_start: 0,
        })
    }

    /// Index of the segment being read
    pub fn segment(&self) -> u64 {
        self.segment
    }

    /// Byte offset of the start of the most recently returned record
    pub fn last_offset(&self) -> u64 {
        self.record_start as u64
    }

    /// Next record, or `Ok(None)` at the end of the segment
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        self.record_start = self.offset;

        let remaining = &self.data[self.offset..];
        if remaining.len() < FRAME_HEADER_LEN {
            // Torn header from a crash mid-write, not corruption.
            self.offset = self.data.len();
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(remaining);
        let len = cursor.get_u32_le() as usize;
        let flags = cursor.get_u8();
        let expected_crc = cursor.get_u32_le();

        if remaining.len() < FRAME_HEADER_LEN + len {
            // Torn payload, same as above.
            self.offset = self.data.len();
            return Ok(None);
        }

        if flags & !FLAG_COMPRESSED != 0 {
            return Err(self.corruption(format!("invalid frame flags: {:#04x}", flags)));
        }

        let payload = &remaining[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            return Err(self.corruption(format!(
                "checksum mismatch: expected {:#010x}, got {:#010x}",
                expected_crc, actual_crc
            )));
        }

        let record = if flags & FLAG_COMPRESSED != 0 {
            match lz4_flex::decompress_size_prepended(payload) {
                Ok(decompressed) => decompressed,
                Err(e) => return Err(self.corruption(format!("decompression failed: {}", e))),
            }
        } else {
            payload.to_vec()
        };

        self.offset += FRAME_HEADER_LEN + len;
        Ok(Some(record))
    }

    pub(crate) fn corruption(&self, reason: String) -> WalError {
        WalError::Corruption {
            dir: self.dir.clone(),
            segment: self.segment,
            offset: self.record_start as u64,
            reason,
        }
    }
}

/// Read every record of every segment under `dir`, in index order
pub fn read_all_records(dir: &Path) -> Result<Vec<Vec<u8>>> {
    let mut records = Vec::new();
    for (index, _) in super::list_segments(dir)? {
        let mut reader = RecordIter::open(dir, index)?;
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::super::{Compression, LogConfig, SegmentLog, SyncPolicy};
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn config(compression: Compression) -> LogConfig {
        LogConfig {
            segment_size: 1024 * 1024,
            compression,
            sync_policy: SyncPolicy::Immediate,
        }
    }

    #[test]
    fn test_round_trip_uncompressed() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentLog::open(temp_dir.path(), config(Compression::None)).unwrap();

        log.log(b"first record").unwrap();
        log.log(b"second record").unwrap();
        log.close().unwrap();

        let mut reader = RecordIter::open(temp_dir.path(), 0).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"first record");
        assert_eq!(reader.next_record().unwrap().unwrap(), b"second record");
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentLog::open(temp_dir.path(), config(Compression::Lz4)).unwrap();

        let big = vec![42u8; 10_000];
        log.log(&big).unwrap();
        log.close().unwrap();

        let mut reader = RecordIter::open(temp_dir.path(), 0).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), big);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_reports_position() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentLog::open(temp_dir.path(), config(Compression::None)).unwrap();

        log.log(b"good record").unwrap();
        log.log(b"bad record").unwrap();
        log.close().unwrap();

        // Flip a payload byte in the second frame.
        let path = super::super::segment_path(temp_dir.path(), 0);
        let mut data = std::fs::read(&path).unwrap();
        let second_frame = FRAME_HEADER_LEN + b"good record".len();
        data[second_frame + FRAME_HEADER_LEN] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let mut reader = RecordIter::open(temp_dir.path(), 0).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"good record");

        let err = reader.next_record().unwrap_err();
        match err {
            WalError::Corruption {
                segment, offset, ..
            } => {
                assert_eq!(segment, 0);
                assert_eq!(offset, second_frame as u64);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_torn_tail_stops_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentLog::open(temp_dir.path(), config(Compression::None)).unwrap();

        log.log(b"kept").unwrap();
        log.log(b"torn away").unwrap();
        log.close().unwrap();

        // Chop the second frame in half, as a crash mid-write would.
        let path = super::super::segment_path(temp_dir.path(), 0);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let mut reader = RecordIter::open(temp_dir.path(), 0).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"kept");
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let temp_dir = TempDir::new().unwrap();

        // Hand-build a frame with an unknown flag bit set.
        let path = super::super::segment_path(temp_dir.path(), 0);
        let payload = b"payload";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.push(0x80);
        frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        frame.extend_from_slice(payload);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&frame).unwrap();

        let mut reader = RecordIter::open(temp_dir.path(), 0).unwrap();
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, WalError::Corruption { .. }));
    }
}
