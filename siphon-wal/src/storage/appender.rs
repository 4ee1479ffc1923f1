//! Batched writes against the storage

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config;
use crate::error::{Result, WalError};
use crate::histogram::HistogramValue;
use crate::record::{
    self, ExemplarRecord, FloatHistogramSampleRecord, HistogramSampleRecord, SampleRecord,
    SeriesRecord,
};
use crate::storage::series::MemSeries;
use crate::storage::Storage;
use crate::types::{Exemplar, Labels, MetricMetadata, SeriesRef, Timestamp};

/// Staged records of one append session, recycled between appenders
#[derive(Default)]
pub(super) struct AppenderBatch {
    pending_series: Vec<SeriesRecord>,
    pending_samples: Vec<SampleRecord>,
    pending_histograms: Vec<HistogramSampleRecord>,
    pending_float_histograms: Vec<FloatHistogramSampleRecord>,
    pending_exemplars: Vec<ExemplarRecord>,

    // Series behind each staged sample, index for index, so commit can
    // advance their timestamps without another lookup.
    sample_series: Vec<Arc<MemSeries>>,
    histogram_series: Vec<Arc<MemSeries>>,
    float_histogram_series: Vec<Arc<MemSeries>>,
}

impl AppenderBatch {
    pub(super) fn new() -> Self {
        Self {
            pending_series: Vec::with_capacity(100),
            pending_samples: Vec::with_capacity(100),
            pending_histograms: Vec::with_capacity(100),
            pending_float_histograms: Vec::with_capacity(100),
            pending_exemplars: Vec::with_capacity(10),
            sample_series: Vec::with_capacity(100),
            histogram_series: Vec::with_capacity(100),
            float_histogram_series: Vec::with_capacity(100),
        }
    }

    fn clear(&mut self) {
        self.pending_series.clear();
        self.pending_samples.clear();
        self.pending_histograms.clear();
        self.pending_float_histograms.clear();
        self.pending_exemplars.clear();
        self.sample_series.clear();
        self.histogram_series.clear();
        self.float_histogram_series.clear();
    }
}

/// Stages samples, series and exemplars, then writes them to the log as
/// one batch on [`Appender::commit`].
///
/// Series created through an appender are live in the in-memory index
/// immediately. Their declarations reach the log on commit, and on
/// [`Appender::rollback`] as well, so replay never resolves samples to a
/// ref that was never declared. An appender that is dropped instead
/// discards its staged records including those declarations.
pub struct Appender<'a> {
    storage: &'a Storage,
    batch: AppenderBatch,
}

impl<'a> Appender<'a> {
    pub(super) fn new(storage: &'a Storage, batch: AppenderBatch) -> Self {
        Self { storage, batch }
    }

    /// Stage one float sample.
    ///
    /// `series_ref` zero (or a ref unknown to the index) resolves the
    /// series by labels, creating it when needed. Returns the ref the
    /// sample was staged under.
    pub fn append(
        &mut self,
        series_ref: SeriesRef,
        labels: &Labels,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<SeriesRef> {
        let series = match self.storage.series.get_by_id(series_ref) {
            Some(series) => series,
            None => self.resolve_or_create(labels)?,
        };

        self.batch.pending_samples.push(SampleRecord {
            series_ref: series.series_ref,
            timestamp,
            value,
        });
        self.batch.sample_series.push(Arc::clone(&series));

        self.storage.metrics.samples_appended.inc();
        Ok(series.series_ref)
    }

    /// Stage one native-histogram sample, validating the histogram first
    pub fn append_histogram(
        &mut self,
        series_ref: SeriesRef,
        labels: &Labels,
        timestamp: Timestamp,
        histogram: HistogramValue,
    ) -> Result<SeriesRef> {
        histogram.validate()?;

        let series = match self.storage.series.get_by_id(series_ref) {
            Some(series) => series,
            None => self.resolve_or_create(labels)?,
        };

        match histogram {
            HistogramValue::Integer(h) => {
                self.batch.pending_histograms.push(HistogramSampleRecord {
                    series_ref: series.series_ref,
                    timestamp,
                    histogram: h,
                });
                self.batch.histogram_series.push(Arc::clone(&series));
            }
            HistogramValue::Float(h) => {
                self.batch
                    .pending_float_histograms
                    .push(FloatHistogramSampleRecord {
                        series_ref: series.series_ref,
                        timestamp,
                        histogram: h,
                    });
                self.batch.float_histogram_series.push(Arc::clone(&series));
            }
        }

        self.storage.metrics.samples_appended.inc();
        Ok(series.series_ref)
    }

    /// Stage one exemplar for an already known series.
    ///
    /// An exemplar equal to the last one seen for the series, or older
    /// than it, is dropped without error and `Ok(0)` is returned.
    pub fn append_exemplar(
        &mut self,
        series_ref: SeriesRef,
        exemplar: Exemplar,
    ) -> Result<SeriesRef> {
        let series = self
            .storage
            .series
            .get_by_id(series_ref)
            .ok_or(WalError::UnknownSeries(series_ref))?;

        let labels = exemplar.labels.without_empty();
        if let Some(name) = labels.duplicate_name() {
            return Err(WalError::InvalidExemplar(format!(
                "label name \"{}\" is not unique",
                name
            )));
        }
        // The length cap counts name and value characters only, not the
        // separators a text rendering would add.
        if labels.char_len() > config::EXEMPLAR_MAX_LABEL_SET_LENGTH {
            return Err(WalError::ExemplarLabelLength(
                config::EXEMPLAR_MAX_LABEL_SET_LENGTH,
            ));
        }

        let exemplar = Exemplar {
            labels,
            value: exemplar.value,
            timestamp: exemplar.timestamp,
        };

        if let Some(prev) = self.storage.series.get_latest_exemplar(series.series_ref) {
            if prev == exemplar || prev.timestamp > exemplar.timestamp {
                return Ok(0);
            }
        }
        self.storage
            .series
            .set_latest_exemplar(series.series_ref, &exemplar);

        self.batch.pending_exemplars.push(ExemplarRecord {
            series_ref: series.series_ref,
            timestamp: exemplar.timestamp,
            value: exemplar.value,
            labels: exemplar.labels,
        });

        self.storage.metrics.exemplars_appended.inc();
        Ok(series.series_ref)
    }

    /// Metadata is not persisted to the log.
    // TODO: write metadata records once the consumer side can use them
    pub fn update_metadata(
        &mut self,
        _series_ref: SeriesRef,
        _metadata: &MetricMetadata,
    ) -> Result<SeriesRef> {
        Ok(0)
    }

    /// Write every staged record to the log and advance series timestamps.
    ///
    /// Samples whose timestamp is older than what their series already
    /// carries are still written; they only bump the out-of-order counter.
    pub fn commit(mut self) -> Result<()> {
        let storage = self.storage;
        let wal = storage.wal.read();
        let log = wal.as_ref().ok_or(WalError::Closed)?;

        let batch = &mut self.batch;
        let mut buf = storage.take_buf();

        if !batch.pending_series.is_empty() {
            buf.clear();
            record::encode_series(&batch.pending_series, &mut buf)?;
            log.log(&buf)?;
        }
        if !batch.pending_samples.is_empty() {
            buf.clear();
            record::encode_samples(&batch.pending_samples, &mut buf)?;
            log.log(&buf)?;
        }
        if !batch.pending_histograms.is_empty() {
            buf.clear();
            record::encode_histogram_samples(&batch.pending_histograms, &mut buf)?;
            log.log(&buf)?;
        }
        if !batch.pending_float_histograms.is_empty() {
            buf.clear();
            record::encode_float_histogram_samples(&batch.pending_float_histograms, &mut buf)?;
            log.log(&buf)?;
        }
        // Exemplars go last. A consumer reading the log in order must see
        // a sample batch before the exemplars attached to it, or it will
        // reject the exemplars for missing series.
        if !batch.pending_exemplars.is_empty() {
            buf.clear();
            record::encode_exemplars(&batch.pending_exemplars, &mut buf)?;
            log.log(&buf)?;
        }

        for (sample, series) in batch.pending_samples.iter().zip(&batch.sample_series) {
            if !series.update_timestamp(sample.timestamp) {
                storage.metrics.out_of_order_samples.inc();
            }
        }
        for (sample, series) in batch.pending_histograms.iter().zip(&batch.histogram_series) {
            if !series.update_timestamp(sample.timestamp) {
                storage.metrics.out_of_order_samples.inc();
            }
        }
        for (sample, series) in batch
            .pending_float_histograms
            .iter()
            .zip(&batch.float_histogram_series)
        {
            if !series.update_timestamp(sample.timestamp) {
                storage.metrics.out_of_order_samples.inc();
            }
        }

        batch.clear();
        storage.put_buf(buf);
        storage.put_batch(std::mem::take(batch));
        Ok(())
    }

    /// Discard staged samples and exemplars.
    ///
    /// Series staged by this appender are live in the index already, so
    /// their declarations are written to the log even here.
    pub fn rollback(mut self) -> Result<()> {
        let storage = self.storage;
        let wal = storage.wal.read();
        let log = wal.as_ref().ok_or(WalError::Closed)?;

        if !self.batch.pending_series.is_empty() {
            let mut buf = storage.take_buf();
            buf.clear();
            record::encode_series(&self.batch.pending_series, &mut buf)?;
            log.log(&buf)?;
            storage.put_buf(buf);
        }

        self.batch.clear();
        storage.put_batch(std::mem::take(&mut self.batch));
        Ok(())
    }

    fn resolve_or_create(&mut self, labels: &Labels) -> Result<Arc<MemSeries>> {
        let labels = labels.without_empty();
        if labels.is_empty() {
            return Err(WalError::InvalidSample("empty labelset".into()));
        }
        if let Some(name) = labels.duplicate_name() {
            return Err(WalError::InvalidSample(format!(
                "label name \"{}\" is not unique",
                name
            )));
        }

        let hash = labels.hash();
        if let Some(series) = self.storage.series.get_by_hash(hash, &labels) {
            return Ok(series);
        }

        let series_ref = self.storage.last_ref.fetch_add(1, Ordering::Relaxed) + 1;
        let series = Arc::new(MemSeries::new(series_ref, labels.clone(), i64::MIN));
        self.storage.series.set(hash, Arc::clone(&series));

        self.batch.pending_series.push(SeriesRecord { series_ref, labels });
        self.storage.metrics.active_series.inc();
        self.storage.metrics.created_series.inc();

        Ok(series)
    }
}
