//! WAL-backed storage for scraped samples
//!
//! [`Storage`] buffers every appended sample and series declaration in an
//! on-disk segment log and mirrors the series in a lock-striped in-memory
//! index. A consumer tails the log at its own pace; [`Storage::truncate`]
//! reclaims segments the consumer no longer needs, compacting still-needed
//! records into a checkpoint first.

mod appender;
mod series;

pub use appender::Appender;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WalError};
use crate::metrics::StorageMetrics;
use crate::record::{self, RecordType};
use crate::types::{now_millis, stale_nan, SeriesRef, Timestamp};
use crate::wlog::{
    self, checkpoint, delete_checkpoints, last_checkpoint, LogConfig, RecordIter, SegmentLog,
};
use appender::AppenderBatch;
use series::{MemSeries, StripeSeries};

/// Subdirectory of a storage path that holds the segment log
pub fn wal_sub_directory(base: impl AsRef<Path>) -> PathBuf {
    base.as_ref().join("wal")
}

/// Durable write-ahead buffer for time-series samples.
///
/// All methods take `&self`; the storage is meant to be shared across
/// scrape threads. Once [`Storage::close`] has run, every operation that
/// needs the log fails with [`WalError::Closed`].
pub struct Storage {
    path: PathBuf,
    /// `None` once closed. Operations hold the read side for their whole
    /// duration so close cannot pull the log out from under them.
    wal: RwLock<Option<SegmentLog>>,

    series: StripeSeries,
    /// Highest ref handed out so far; refs start at 1, 0 means "no ref".
    last_ref: AtomicU64,

    /// Refs gc'd from memory, keyed by the last segment that may still
    /// hold their records. Their declarations are carried in checkpoints
    /// until truncation passes that segment.
    deleted: Mutex<HashMap<SeriesRef, u64>>,

    batch_pool: Mutex<Vec<AppenderBatch>>,
    buf_pool: Mutex<Vec<Vec<u8>>>,

    metrics: StorageMetrics,
}

impl Storage {
    /// Open the storage at `path`, replaying any existing log.
    ///
    /// Metric instruments are registered with `registry` when one is
    /// given and unregistered again on close.
    pub fn open(registry: Option<&Registry>, path: impl Into<PathBuf>) -> Result<Storage> {
        Self::open_with_config(registry, path, LogConfig::default())
    }

    /// Open with an explicit log configuration
    pub fn open_with_config(
        registry: Option<&Registry>,
        path: impl Into<PathBuf>,
        config: LogConfig,
    ) -> Result<Storage> {
        let path = path.into();
        let log = SegmentLog::open(wal_sub_directory(&path), config)?;

        let storage = Storage {
            path,
            wal: RwLock::new(Some(log)),
            series: StripeSeries::new(crate::config::STRIPE_SIZE),
            last_ref: AtomicU64::new(0),
            deleted: Mutex::new(HashMap::new()),
            batch_pool: Mutex::new(Vec::new()),
            buf_pool: Mutex::new(Vec::new()),
            metrics: StorageMetrics::new(registry)?,
        };

        let start = Instant::now();
        if let Err(e) = storage.replay() {
            if !e.is_corruption() {
                return Err(e);
            }
            warn!("encountered WAL read error, attempting repair: {}", e);

            let repaired = {
                let wal = storage.wal.read();
                wal.as_ref()
                    .ok_or(WalError::Closed)
                    .and_then(|log| log.repair(&e))
            };
            if let Err(repair_err) = repaired {
                // The storage must come up usable even then. Whatever was
                // buffered is gone; start over on an empty log.
                error!(
                    "WAL repair failed, dropping buffered data: {}",
                    repair_err
                );
                storage.reset_to_empty()?;
            }
        }
        debug!("replaying WAL took {:?}", start.elapsed());

        Ok(storage)
    }

    /// Base path the storage was opened at
    pub fn directory(&self) -> &Path {
        &self.path
    }

    /// Start a new batched append session
    pub fn appender(&self) -> Appender<'_> {
        Appender::new(self, self.take_batch())
    }

    /// Remove data the consumer is done with.
    ///
    /// Series without an update since `min_ts` are dropped from memory.
    /// The older two thirds of closed segments are compacted into a
    /// checkpoint holding only still-needed records, then deleted.
    pub fn truncate(&self, min_ts: Timestamp) -> Result<()> {
        let wal = self.wal.read();
        let log = wal.as_ref().ok_or(WalError::Closed)?;

        let start = Instant::now();

        self.gc(log, min_ts)?;
        info!("series GC completed, duration {:?}", start.elapsed());

        let (first, last) = match log.segments_range()? {
            Some(range) => range,
            None => return Ok(()),
        };

        // Roll to a fresh segment first so a low-volume instance does not
        // sit on one half-filled segment forever.
        log.next_segment()?;

        // The boundary math can dip below zero.
        let first = first as i64;
        let mut last = last as i64;

        last -= 1; // the most recent closed segment is never checkpointed
        if last < 0 {
            return Ok(());
        }
        // The lower two thirds of closed segments hold mostly obsolete
        // samples; fewer than two candidates is not worth a checkpoint.
        last = first + (last - first) * 2 / 3;
        if last <= first {
            return Ok(());
        }

        let first = first as u64;
        let last = last as u64;

        let deleted = self.deleted.lock().clone();
        let keep = |id: SeriesRef| -> bool {
            if self.series.get_by_id(id).is_some() {
                return true;
            }
            deleted.get(&id).is_some_and(|segment| *segment > last)
        };
        checkpoint(log, first, last, keep, min_ts)?;

        if let Err(e) = log.truncate(last + 1) {
            // Leftover segments are superseded by the checkpoint; replay
            // ignores them and the next truncation retries the delete.
            error!("WAL truncation failed: {}", e);
        }

        // The checkpoint covers everything up to `last`; series deleted
        // at or before it need no further tracking.
        {
            let mut deleted = self.deleted.lock();
            deleted.retain(|_, segment| {
                if *segment <= last {
                    self.metrics.removed_series.inc();
                    false
                } else {
                    true
                }
            });
            self.metrics.deleted_series.set(deleted.len() as i64);
        }

        if let Err(e) = delete_checkpoints(log.dir(), last) {
            // Old checkpoints only cost disk space; replay reads just the
            // newest one.
            error!("error deleting old checkpoints: {}", e);
        }

        info!(
            "WAL checkpoint complete: segments {} to {}, duration {:?}",
            first,
            last,
            start.elapsed()
        );
        Ok(())
    }

    /// Append a staleness marker for every live series and wait until the
    /// consumer position reported by `remote_ts` has moved past them.
    ///
    /// Meant to run right before shutdown so the receiving end does not
    /// treat every series of this instance as still alive.
    pub fn write_staleness_markers(&self, remote_ts: impl Fn() -> Timestamp) -> Result<()> {
        let mut last_err = None;
        let mut last_ts: Timestamp = 0;

        let mut app = self.appender();
        for series in self.series.iter() {
            let ts = now_millis();
            if let Err(e) = app.append(series.series_ref, &series.labels, ts, stale_nan()) {
                last_err = Some(e);
            }

            // The consumer position only has second precision.
            let ts_secs = ts / 1000 * 1000;
            if ts_secs > last_ts {
                last_ts = ts_secs;
            }
        }

        if let Some(e) = last_err {
            return Err(e);
        }
        app.commit()?;

        info!("waiting for consumer to ship staleness markers");
        let start = Instant::now();
        loop {
            if start.elapsed() >= crate::config::STALENESS_WAIT_TIMEOUT {
                error!("timed out waiting for staleness markers to be shipped");
                break;
            }

            let written_ts = remote_ts();
            if written_ts >= last_ts {
                info!(
                    "staleness markers shipped, duration {:?}",
                    start.elapsed()
                );
                break;
            }

            info!(
                "staleness markers not shipped yet: consumer at {}, waiting for {}",
                written_ts, last_ts
            );
            std::thread::sleep(crate::config::STALENESS_POLL_INTERVAL);
        }

        Ok(())
    }

    /// Flush and close the log and drop the metric instruments.
    ///
    /// Returns [`WalError::AlreadyClosed`] on the second call.
    pub fn close(&self) -> Result<()> {
        let mut wal = self.wal.write();
        let log = wal.take().ok_or(WalError::AlreadyClosed)?;

        self.metrics.unregister();
        log.close()
    }

    fn gc(&self, log: &SegmentLog, min_ts: Timestamp) -> Result<()> {
        let removed = self.series.gc(min_ts);
        self.metrics.active_series.sub(removed.len() as i64);

        let last = log.segments_range()?.map(|(_, last)| last).unwrap_or(0);

        // Keep declarations of freshly dead series around until the log
        // has been truncated past the last segment that may still hold
        // their samples.
        let mut deleted = self.deleted.lock();
        for series_ref in removed {
            deleted.insert(series_ref, last);
        }
        self.metrics.deleted_series.set(deleted.len() as i64);

        Ok(())
    }

    fn replay(&self) -> Result<()> {
        let wal = self.wal.read();
        let log = wal.as_ref().ok_or(WalError::Closed)?;
        let dir = log.dir();

        info!("replaying WAL, this may take a while: {}", dir.display());

        // Refs that have been seen as series declarations. Samples with a
        // ref outside this map are counted and skipped.
        let mut multi_ref: HashMap<SeriesRef, SeriesRef> = HashMap::new();
        let mut start_from = 0;

        if let Some((cp_dir, cp_index)) = last_checkpoint(dir)? {
            for (index, _) in wlog::list_segments(&cp_dir)? {
                let mut reader = RecordIter::open(&cp_dir, index)?;
                self.load_records(&mut reader, &mut multi_ref)?;
            }
            start_from = cp_index + 1;
            debug!("WAL checkpoint loaded");
        }

        for (index, _) in wlog::list_segments(dir)? {
            if index < start_from {
                continue;
            }
            let mut reader = RecordIter::open(dir, index)?;
            self.load_records(&mut reader, &mut multi_ref)?;
            debug!("WAL segment loaded: {}", index);
        }

        Ok(())
    }

    fn load_records(
        &self,
        reader: &mut RecordIter,
        multi_ref: &mut HashMap<SeriesRef, SeriesRef>,
    ) -> Result<()> {
        let mut last_ref = self.last_ref.load(Ordering::Relaxed);
        let mut unknown_refs = 0u64;

        while let Some(data) = reader.next_record()? {
            let record_type = match record::record_type(&data) {
                Ok(t) => t,
                Err(e) => return Err(reader.corruption(format!("{}", e))),
            };
            match record_type {
                RecordType::Series => {
                    let records = record::decode_series(&data)
                        .map_err(|e| reader.corruption(format!("decode series: {}", e)))?;
                    for s in records {
                        if self.series.get_by_id(s.series_ref).is_none() {
                            // A replayed series starts with no timestamp;
                            // the first sample read for it assigns one. A
                            // series with no samples left in the log is
                            // then swept by the next truncation.
                            let hash = s.labels.hash();
                            let series = Arc::new(MemSeries::new(s.series_ref, s.labels, 0));
                            self.series.set(hash, series);
                            multi_ref.insert(s.series_ref, s.series_ref);

                            self.metrics.active_series.inc();
                            self.metrics.created_series.inc();

                            last_ref = last_ref.max(s.series_ref);
                        }
                    }
                }
                RecordType::Samples => {
                    let records = record::decode_samples(&data)
                        .map_err(|e| reader.corruption(format!("decode samples: {}", e)))?;
                    for s in records {
                        match multi_ref
                            .get(&s.series_ref)
                            .and_then(|r| self.series.get_by_id(*r))
                        {
                            Some(series) => {
                                series.update_timestamp(s.timestamp);
                            }
                            None => unknown_refs += 1,
                        }
                    }
                }
                RecordType::HistogramSamples => {
                    let records = record::decode_histogram_samples(&data).map_err(|e| {
                        reader.corruption(format!("decode histogram samples: {}", e))
                    })?;
                    for s in records {
                        match multi_ref
                            .get(&s.series_ref)
                            .and_then(|r| self.series.get_by_id(*r))
                        {
                            Some(series) => {
                                series.update_timestamp(s.timestamp);
                            }
                            None => unknown_refs += 1,
                        }
                    }
                }
                RecordType::FloatHistogramSamples => {
                    let records = record::decode_float_histogram_samples(&data).map_err(|e| {
                        reader.corruption(format!("decode float histogram samples: {}", e))
                    })?;
                    for s in records {
                        match multi_ref
                            .get(&s.series_ref)
                            .and_then(|r| self.series.get_by_id(*r))
                        {
                            Some(series) => {
                                series.update_timestamp(s.timestamp);
                            }
                            None => unknown_refs += 1,
                        }
                    }
                }
                // Exemplars do not affect series lifetimes and deletion
                // markers have nothing to apply to here.
                RecordType::Exemplars | RecordType::Tombstones => {}
            }
        }

        if unknown_refs > 0 {
            warn!(
                "found samples referencing non-existing series, skipped {}",
                unknown_refs
            );
        }
        self.last_ref.fetch_max(last_ref, Ordering::Relaxed);

        Ok(())
    }

    /// Drop every buffered series and start the log over on fresh
    /// segments. Ref allocation is not rewound, so refs stay unique
    /// across the reset.
    fn reset_to_empty(&self) -> Result<()> {
        let wal = self.wal.read();
        let log = wal.as_ref().ok_or(WalError::Closed)?;

        log.next_segment()?;
        log.truncate(u64::MAX)?;
        delete_checkpoints(log.dir(), u64::MAX)?;

        let removed = self.series.clear();
        self.metrics.active_series.sub(removed as i64);
        self.deleted.lock().clear();
        self.metrics.deleted_series.set(0);

        Ok(())
    }

    fn take_batch(&self) -> AppenderBatch {
        self.batch_pool
            .lock()
            .pop()
            .unwrap_or_else(AppenderBatch::new)
    }

    fn put_batch(&self, batch: AppenderBatch) {
        self.batch_pool.lock().push(batch);
    }

    fn take_buf(&self) -> Vec<u8> {
        self.buf_pool
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(1024))
    }

    fn put_buf(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.buf_pool.lock().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{FloatHistogram, Histogram, HistogramValue};
    use crate::types::{is_stale_nan, Exemplar, Labels};
    use crate::wlog::read_all_records;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn test_labels(name: &str) -> Labels {
        Labels::from_pairs([("__name__", name)])
    }

    fn open_storage(path: &Path) -> Storage {
        Storage::open(None, path).unwrap()
    }

    fn wal_dir(storage: &Storage) -> PathBuf {
        wal_sub_directory(storage.directory())
    }

    fn force_segments(storage: &Storage, n: usize) {
        let wal = storage.wal.read();
        let log = wal.as_ref().unwrap();
        for _ in 0..n {
            log.next_segment().unwrap();
        }
    }

    fn record_types(dir: &Path) -> Vec<RecordType> {
        read_all_records(dir)
            .unwrap()
            .iter()
            .map(|data| record::record_type(data).unwrap())
            .collect()
    }

    fn flip_last_byte(path: &Path) {
        let mut data = std::fs::read(path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(path, &data).unwrap();
    }

    #[test]
    fn test_append_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        for (i, name) in ["foo", "bar", "baz"].into_iter().enumerate() {
            let series_ref = app
                .append(0, &test_labels(name), 100, (i + 1) as f64)
                .unwrap();
            assert_eq!(series_ref, (i + 1) as u64);
        }
        app.commit().unwrap();

        let mut series = Vec::new();
        let mut samples = Vec::new();
        for data in read_all_records(&wal_dir(&storage)).unwrap() {
            match record::record_type(&data).unwrap() {
                RecordType::Series => series.extend(record::decode_series(&data).unwrap()),
                RecordType::Samples => samples.extend(record::decode_samples(&data).unwrap()),
                other => panic!("unexpected record type {:?}", other),
            }
        }

        let names: Vec<_> = series
            .iter()
            .map(|s| s.labels.get("__name__").unwrap().to_string())
            .collect();
        assert_eq!(names, ["foo", "bar", "baz"]);
        for sample in samples {
            assert_eq!(sample.value, sample.series_ref as f64);
        }

        storage.close().unwrap();
    }

    #[test]
    fn test_same_labels_resolve_to_same_ref() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        let first = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = storage.appender();
        let second = app.append(0, &test_labels("foo"), 200, 2.0).unwrap();
        app.commit().unwrap();

        assert_eq!(first, second);

        // Only the first commit may carry a series declaration.
        let types = record_types(&wal_dir(&storage));
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == RecordType::Series)
                .count(),
            1
        );
        storage.close().unwrap();
    }

    #[test]
    fn test_invalid_series_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();

        let err = app.append(0, &Labels::empty(), 0, 0.0).unwrap_err();
        assert!(matches!(err, WalError::InvalidSample(_)));

        // Labels with only empty values reduce to an empty set.
        let empty_values = Labels::from_pairs([("job", "")]);
        let err = app.append(0, &empty_values, 0, 0.0).unwrap_err();
        assert!(matches!(err, WalError::InvalidSample(_)));

        let duplicates = Labels::from_pairs([("job", "a"), ("job", "b")]);
        let err = app.append(0, &duplicates, 0, 0.0).unwrap_err();
        assert!(matches!(err, WalError::InvalidSample(_)));

        assert!(app.append(0, &test_labels("ok"), 0, 0.0).is_ok());
        app.commit().unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_reopen_restores_series() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        let foo = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        let bar = app.append(0, &test_labels("bar"), 200, 2.0).unwrap();
        app.commit().unwrap();
        storage.close().unwrap();

        let storage = open_storage(temp_dir.path());
        let lset = test_labels("foo");
        let series = storage.series.get_by_hash(lset.hash(), &lset).unwrap();
        assert_eq!(series.series_ref, foo);
        assert_eq!(series.last_timestamp(), 100);

        let lset = test_labels("bar");
        let series = storage.series.get_by_hash(lset.hash(), &lset).unwrap();
        assert_eq!(series.series_ref, bar);
        assert_eq!(series.last_timestamp(), 200);

        // Ref allocation continues past the replayed refs.
        let mut app = storage.appender();
        let next = app.append(0, &test_labels("new"), 300, 3.0).unwrap();
        assert_eq!(next, bar + 1);
        app.commit().unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_replay_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.append(0, &test_labels("bar"), 100, 2.0).unwrap();
        app.commit().unwrap();
        storage.close().unwrap();

        for _ in 0..3 {
            let storage = open_storage(temp_dir.path());
            assert_eq!(storage.series.iter().count(), 2);
            assert_eq!(storage.last_ref.load(Ordering::Relaxed), 2);
            storage.close().unwrap();
        }
    }

    #[test]
    fn test_rollback_still_logs_series() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.rollback().unwrap();

        assert_eq!(record_types(&wal_dir(&storage)), [RecordType::Series]);
        storage.close().unwrap();

        // The declaration makes it through a restart; the sample does not.
        let storage = open_storage(temp_dir.path());
        let series = storage.series.get_by_id(series_ref).unwrap();
        assert_eq!(series.last_timestamp(), 0);
        storage.close().unwrap();
    }

    #[test]
    fn test_dropped_appender_discards_batch() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        drop(app);

        // Nothing reached the log, but the series is live in memory.
        assert!(read_all_records(&wal_dir(&storage)).unwrap().is_empty());
        assert!(storage.series.get_by_id(series_ref).is_some());
        storage.close().unwrap();
    }

    #[test]
    fn test_commit_writes_exemplars_last() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.append_exemplar(
            series_ref,
            Exemplar {
                labels: Labels::from_pairs([("trace_id", "abc")]),
                value: 1.0,
                timestamp: 100,
            },
        )
        .unwrap();
        app.append_histogram(
            0,
            &test_labels("hist"),
            100,
            HistogramValue::Integer(Histogram::default()),
        )
        .unwrap();
        app.append_histogram(
            0,
            &test_labels("float_hist"),
            100,
            HistogramValue::Float(FloatHistogram::default()),
        )
        .unwrap();
        app.commit().unwrap();

        assert_eq!(
            record_types(&wal_dir(&storage)),
            [
                RecordType::Series,
                RecordType::Samples,
                RecordType::HistogramSamples,
                RecordType::FloatHistogramSamples,
                RecordType::Exemplars,
            ]
        );
        storage.close().unwrap();
    }

    #[test]
    fn test_out_of_order_samples_counted_not_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 200, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 100, 2.0).unwrap();
        app.commit().unwrap();

        assert_eq!(storage.metrics.out_of_order_samples.get(), 1);

        // The sample was still written.
        let types = record_types(&wal_dir(&storage));
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == RecordType::Samples)
                .count(),
            2
        );
        storage.close().unwrap();
    }

    #[test]
    fn test_exemplar_dedup_and_validation() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();

        let err = app
            .append_exemplar(
                42,
                Exemplar {
                    labels: Labels::from_pairs([("trace_id", "abc")]),
                    value: 1.0,
                    timestamp: 100,
                },
            )
            .unwrap_err();
        assert!(matches!(err, WalError::UnknownSeries(42)));

        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();

        let first = Exemplar {
            labels: Labels::from_pairs([("trace_id", "abc")]),
            value: 1.0,
            timestamp: 100,
        };
        assert_eq!(app.append_exemplar(series_ref, first.clone()).unwrap(), series_ref);

        // Exact duplicate and older exemplar are dropped without error.
        assert_eq!(app.append_exemplar(series_ref, first.clone()).unwrap(), 0);
        let older = Exemplar {
            timestamp: 50,
            ..first.clone()
        };
        assert_eq!(app.append_exemplar(series_ref, older).unwrap(), 0);

        // Same timestamp with a different payload is kept.
        let same_ts = Exemplar {
            value: 2.0,
            ..first.clone()
        };
        assert_eq!(app.append_exemplar(series_ref, same_ts).unwrap(), series_ref);

        let dup_names = Exemplar {
            labels: Labels::from_pairs([("trace_id", "a"), ("trace_id", "b")]),
            value: 3.0,
            timestamp: 300,
        };
        let err = app.append_exemplar(series_ref, dup_names).unwrap_err();
        assert!(matches!(err, WalError::InvalidExemplar(_)));

        let oversized = Exemplar {
            labels: Labels::from_pairs([("trace_id", "x".repeat(200))]),
            value: 4.0,
            timestamp: 400,
        };
        let err = app.append_exemplar(series_ref, oversized).unwrap_err();
        assert!(matches!(err, WalError::ExemplarLabelLength(_)));

        app.commit().unwrap();

        let mut logged = 0;
        for data in read_all_records(&wal_dir(&storage)).unwrap() {
            if record::record_type(&data).unwrap() == RecordType::Exemplars {
                logged += record::decode_exemplars(&data).unwrap().len();
            }
        }
        assert_eq!(logged, 2);
        storage.close().unwrap();
    }

    #[test]
    fn test_histogram_validation() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();

        let invalid = Histogram {
            count: 5,
            ..Histogram::default()
        };
        let err = app
            .append_histogram(0, &test_labels("hist"), 100, HistogramValue::Integer(invalid))
            .unwrap_err();
        assert!(matches!(err, WalError::InvalidHistogram(_)));

        app.append_histogram(
            0,
            &test_labels("hist"),
            100,
            HistogramValue::Integer(Histogram::default()),
        )
        .unwrap();
        app.commit().unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_truncate_without_enough_segments() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.commit().unwrap();

        // One active segment, then two. Neither run checkpoints anything.
        storage.truncate(50).unwrap();
        storage.truncate(50).unwrap();
        assert!(last_checkpoint(&wal_dir(&storage)).unwrap().is_none());
        storage.close().unwrap();
    }

    #[test]
    fn test_truncate_gc_watermark() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let lset = test_labels("up");

        let mut app = storage.appender();
        let series_ref = app.append(0, &lset, 100, 1.0).unwrap();
        assert_eq!(app.append(series_ref, &lset, 200, 1.0).unwrap(), series_ref);
        app.commit().unwrap();

        let series = storage.series.get_by_id(series_ref).unwrap();
        assert_eq!(series.last_timestamp(), 200);
        drop(series);

        // Updated at or past the watermark: survives.
        storage.truncate(150).unwrap();
        assert!(storage.series.get_by_hash(lset.hash(), &lset).is_some());
        assert_eq!(storage.metrics.active_series.get(), 1);

        // Watermark moved past its last sample: dropped.
        storage.truncate(250).unwrap();
        assert!(storage.series.get_by_hash(lset.hash(), &lset).is_none());
        assert!(storage.series.get_by_id(series_ref).is_none());
        assert_eq!(storage.metrics.active_series.get(), 0);
        storage.close().unwrap();
    }

    #[test]
    fn test_truncate_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        let mut app = storage.appender();
        let old_ref = app.append(0, &test_labels("old"), 100, 1.0).unwrap();
        app.append(0, &test_labels("fresh"), 100, 2.0).unwrap();
        app.commit().unwrap();

        let mut app = storage.appender();
        let fresh_ref = app.append(0, &test_labels("fresh"), 1000, 3.0).unwrap();
        app.commit().unwrap();

        force_segments(&storage, 5);
        storage.truncate(500).unwrap();

        // "old" is gone from memory but still tracked: segments that may
        // hold its samples are not all truncated yet.
        assert!(storage.series.get_by_id(old_ref).is_none());
        assert!(storage.series.get_by_id(fresh_ref).is_some());
        assert_eq!(storage.metrics.active_series.get(), 1);
        assert_eq!(storage.metrics.deleted_series.get(), 1);
        assert_eq!(storage.metrics.removed_series.get(), 0);
        let (_, cp_index) = last_checkpoint(&wal_dir(&storage)).unwrap().unwrap();
        assert_eq!(cp_index, 2);

        // Once truncation passes the segment "old" was last seen in, its
        // tracking entry goes away too.
        force_segments(&storage, 7);
        storage.truncate(500).unwrap();

        assert_eq!(storage.metrics.deleted_series.get(), 0);
        assert_eq!(storage.metrics.removed_series.get(), 1);
        let (_, cp_index) = last_checkpoint(&wal_dir(&storage)).unwrap().unwrap();
        assert_eq!(cp_index, 9);
        storage.close().unwrap();

        // Replay goes through the checkpoint: "fresh" survives with its
        // timestamp, "old" is gone entirely.
        let storage = open_storage(temp_dir.path());
        assert_eq!(storage.series.iter().count(), 1);
        assert!(storage.series.get_by_id(old_ref).is_none());
        let series = storage.series.get_by_id(fresh_ref).unwrap();
        assert_eq!(series.last_timestamp(), 1000);

        let mut app = storage.appender();
        let next = app.append(0, &test_labels("new"), 2000, 4.0).unwrap();
        assert_eq!(next, fresh_ref + 1);
        app.commit().unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_operations_after_close() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        storage.close().unwrap();

        // Appending only touches memory; committing needs the log.
        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        let err = app.commit().unwrap_err();
        assert!(matches!(err, WalError::Closed));

        let err = storage.truncate(0).unwrap_err();
        assert!(matches!(err, WalError::Closed));

        let err = storage.close().unwrap_err();
        assert!(matches!(err, WalError::AlreadyClosed));
    }

    #[test]
    fn test_replay_skips_unknown_sample_refs() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        storage.close().unwrap();

        // Hand-write a samples record for a ref that was never declared.
        let log = SegmentLog::open(wal_sub_directory(temp_dir.path()), LogConfig::default())
            .unwrap();
        let mut buf = Vec::new();
        record::encode_samples(
            &[record::SampleRecord {
                series_ref: 999,
                timestamp: 10,
                value: 1.0,
            }],
            &mut buf,
        )
        .unwrap();
        log.log(&buf).unwrap();
        log.close().unwrap();

        let storage = open_storage(temp_dir.path());
        assert_eq!(storage.series.iter().count(), 0);
        storage.close().unwrap();
    }

    #[test]
    fn test_repair_recovers_valid_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();
        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.commit().unwrap();
        storage.close().unwrap();

        // Damage the samples frame; the series frame before it is intact.
        flip_last_byte(&wal_sub_directory(temp_dir.path()).join("00000000.wal"));

        let storage = open_storage(temp_dir.path());
        let series = storage.series.get_by_id(series_ref).unwrap();
        assert_eq!(series.last_timestamp(), 0);
        assert_eq!(record_types(&wal_dir(&storage)), [RecordType::Series]);

        // Still writable after the repair.
        let mut app = storage.appender();
        app.append(series_ref, &test_labels("foo"), 200, 2.0).unwrap();
        app.commit().unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_corrupt_checkpoint_resets_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();
        app.append(0, &test_labels("fresh"), 1000, 1.0).unwrap();
        app.commit().unwrap();
        force_segments(&storage, 5);
        storage.truncate(500).unwrap();
        let (cp_dir, _) = last_checkpoint(&wal_dir(&storage)).unwrap().unwrap();
        storage.close().unwrap();

        // A damaged checkpoint cannot be repaired in place; the storage
        // must still come up, empty.
        flip_last_byte(&cp_dir.join("00000000.wal"));

        let storage = open_storage(temp_dir.path());
        assert_eq!(storage.series.iter().count(), 0);
        assert_eq!(storage.metrics.active_series.get(), 0);
        assert!(last_checkpoint(&wal_dir(&storage)).unwrap().is_none());

        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.commit().unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_staleness_markers() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();
        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.commit().unwrap();

        // The consumer is already past any timestamp we could write, so
        // this returns without waiting.
        storage.write_staleness_markers(|| i64::MAX).unwrap();

        let mut samples = Vec::new();
        for data in read_all_records(&wal_dir(&storage)).unwrap() {
            if record::record_type(&data).unwrap() == RecordType::Samples {
                samples.extend(record::decode_samples(&data).unwrap());
            }
        }
        assert_eq!(samples.len(), 2);
        let marker = &samples[1];
        assert_eq!(marker.series_ref, series_ref);
        assert!(is_stale_nan(marker.value));
        assert!(marker.timestamp > 100);
        storage.close().unwrap();
    }

    #[test]
    fn test_concurrent_appends() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(open_storage(temp_dir.path()));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let storage = Arc::clone(&storage);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    let mut app = storage.appender();
                    let name = format!("t{}_s{}", t, i);
                    app.append(0, &test_labels(&name), i as i64, i as f64)
                        .unwrap();
                    app.commit().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.series.iter().count(), 200);
        let mut refs: Vec<_> = storage.series.iter().map(|s| s.series_ref).collect();
        refs.sort_unstable();
        refs.dedup();
        assert_eq!(refs.len(), 200);
        assert_eq!(storage.metrics.created_series.get(), 200);
        storage.close().unwrap();
    }

    #[test]
    fn test_concurrent_create_same_series() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(open_storage(temp_dir.path()));

        let mut handles = Vec::new();
        for t in 0..4i64 {
            let storage = Arc::clone(&storage);
            handles.push(std::thread::spawn(move || {
                let mut app = storage.appender();
                app.append(0, &test_labels("shared"), t, 1.0).unwrap();
                app.commit().unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Racing creators may each burn a ref, but the hash index keeps a
        // single winner for the label set and later appends stick to it.
        let lset = test_labels("shared");
        let winner = storage.series.get_by_hash(lset.hash(), &lset).unwrap();
        let created = storage.metrics.created_series.get();

        let mut app = storage.appender();
        let series_ref = app.append(0, &lset, 999, 9.9).unwrap();
        assert_eq!(series_ref, winner.series_ref);
        app.commit().unwrap();
        assert_eq!(storage.metrics.created_series.get(), created);
        storage.close().unwrap();
    }

    #[test]
    fn test_metrics_registry_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let registry = Registry::new();

        let storage = Storage::open(Some(&registry), temp_dir.path()).unwrap();
        let mut app = storage.appender();
        app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.append(0, &test_labels("bar"), 100, 2.0).unwrap();
        app.commit().unwrap();

        let families = registry.gather();
        let active = families
            .iter()
            .find(|f| f.get_name() == "siphon_wal_storage_active_series")
            .unwrap();
        assert_eq!(active.get_metric()[0].get_gauge().get_value(), 2.0);

        // Close unregisters, so the same registry can back a new storage.
        storage.close().unwrap();
        assert!(registry.gather().is_empty());
        let storage = Storage::open(Some(&registry), temp_dir.path()).unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn test_directory_layout() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());

        assert_eq!(storage.directory(), temp_dir.path());
        assert!(wal_sub_directory(temp_dir.path())
            .join("00000000.wal")
            .is_file());
        storage.close().unwrap();
    }

    #[test]
    fn test_torn_write_is_dropped_on_replay() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(temp_dir.path());
        let mut app = storage.appender();
        let series_ref = app.append(0, &test_labels("foo"), 100, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = storage.appender();
        app.append(series_ref, &test_labels("foo"), 200, 2.0).unwrap();
        app.commit().unwrap();
        storage.close().unwrap();

        // Chop the tail mid-frame, as a crash during the second commit
        // would have.
        let segment = wal_sub_directory(temp_dir.path()).join("00000000.wal");
        let len = std::fs::metadata(&segment).unwrap().len();
        let file = OpenOptions::new().write(true).open(&segment).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let storage = open_storage(temp_dir.path());
        let series = storage.series.get_by_id(series_ref).unwrap();
        assert_eq!(series.last_timestamp(), 100);
        storage.close().unwrap();
    }
}
