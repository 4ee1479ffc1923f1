//! Checkpoints compact the records of old segments

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{
    checkpoint_dir_name, list_segments, parse_checkpoint_dir_name, read_all_records, RecordIter,
    SegmentLog,
};
use crate::error::Result;
use crate::record::{self, RecordType};
use crate::types::{SeriesRef, Timestamp};

/// Compact segments `from..=to` into a checkpoint directory.
///
/// Series records survive when `keep` says so, samples and exemplars when
/// their timestamp is at or past `min_ts`, tombstones never. A previous
/// checkpoint is folded in and re-filtered, so a series that stays alive
/// across many truncations keeps exactly one declaration on disk.
///
/// The checkpoint is built under a `.tmp` name and renamed only once it is
/// complete; a crash mid-build leaves the old state intact.
pub fn checkpoint(
    log: &SegmentLog,
    from: u64,
    to: u64,
    keep: impl Fn(SeriesRef) -> bool,
    min_ts: Timestamp,
) -> Result<PathBuf> {
    let dir = log.dir();
    let cp_dir = dir.join(checkpoint_dir_name(to));
    let cp_tmp = dir.join(format!("{}.tmp", checkpoint_dir_name(to)));

    let mut from = from;
    let mut prev_records = Vec::new();
    if let Some((prev_dir, prev_index)) = last_checkpoint(dir)? {
        prev_records = read_all_records(&prev_dir)?;
        // Segments below the previous checkpoint are already covered by it.
        from = from.max(prev_index + 1);
    }

    if cp_tmp.exists() {
        fs::remove_dir_all(&cp_tmp)?;
    }
    let cp_log = SegmentLog::open(&cp_tmp, log.config().clone())?;

    let mut buf = Vec::new();
    for data in &prev_records {
        if filter_record(data, &keep, min_ts, &mut buf)? {
            cp_log.log(&buf)?;
        }
    }
    for (index, _) in list_segments(dir)? {
        if index < from || index > to {
            continue;
        }
        let mut reader = RecordIter::open(dir, index)?;
        while let Some(data) = reader.next_record()? {
            if filter_record(&data, &keep, min_ts, &mut buf)? {
                cp_log.log(&buf)?;
            }
        }
    }

    cp_log.close()?;
    fs::rename(&cp_tmp, &cp_dir)?;

    Ok(cp_dir)
}

/// Re-encode the surviving part of one record into `buf`.
///
/// Returns false when nothing survives and the record should be skipped.
fn filter_record(
    data: &[u8],
    keep: &impl Fn(SeriesRef) -> bool,
    min_ts: Timestamp,
    buf: &mut Vec<u8>,
) -> Result<bool> {
    buf.clear();
    match record::record_type(data)? {
        RecordType::Series => {
            let mut series = record::decode_series(data)?;
            series.retain(|s| keep(s.series_ref));
            if series.is_empty() {
                return Ok(false);
            }
            record::encode_series(&series, buf)?;
        }
        RecordType::Samples => {
            let mut samples = record::decode_samples(data)?;
            samples.retain(|s| s.timestamp >= min_ts);
            if samples.is_empty() {
                return Ok(false);
            }
            record::encode_samples(&samples, buf)?;
        }
        RecordType::HistogramSamples => {
            let mut samples = record::decode_histogram_samples(data)?;
            samples.retain(|s| s.timestamp >= min_ts);
            if samples.is_empty() {
                return Ok(false);
            }
            record::encode_histogram_samples(&samples, buf)?;
        }
        RecordType::FloatHistogramSamples => {
            let mut samples = record::decode_float_histogram_samples(data)?;
            samples.retain(|s| s.timestamp >= min_ts);
            if samples.is_empty() {
                return Ok(false);
            }
            record::encode_float_histogram_samples(&samples, buf)?;
        }
        RecordType::Exemplars => {
            let mut exemplars = record::decode_exemplars(data)?;
            exemplars.retain(|e| e.timestamp >= min_ts);
            if exemplars.is_empty() {
                return Ok(false);
            }
            record::encode_exemplars(&exemplars, buf)?;
        }
        // Deletion markers have done their job by checkpoint time.
        RecordType::Tombstones => return Ok(false),
    }
    Ok(true)
}

/// Locate the newest completed checkpoint under `dir`, if any
pub fn last_checkpoint(dir: &Path) -> Result<Option<(PathBuf, u64)>> {
    let mut newest: Option<(PathBuf, u64)> = None;

    if !dir.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(index) = parse_checkpoint_dir_name(name) {
                if newest.as_ref().map_or(true, |(_, best)| index > *best) {
                    newest = Some((path, index));
                }
            }
        }
    }

    Ok(newest)
}

/// Delete completed checkpoints below `max_index` and any abandoned
/// `.tmp` build directories.
///
/// All candidates are attempted; the first error (if any) is returned.
pub fn delete_checkpoints(dir: &Path, max_index: u64) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut first_err = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let abandoned = name
            .strip_suffix(".tmp")
            .and_then(parse_checkpoint_dir_name)
            .is_some();
        let below = parse_checkpoint_dir_name(name).is_some_and(|index| index < max_index);
        if !abandoned && !below {
            continue;
        }

        debug!("removing checkpoint {}", path.display());
        if let Err(e) = fs::remove_dir_all(&path) {
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
