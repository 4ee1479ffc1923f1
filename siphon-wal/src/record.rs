//! Typed WAL records and their serialization
//!
//! Every record logged to a segment is one tag byte followed by a
//! bincode-encoded batch of the per-kind structs below. Replay and
//! checkpointing dispatch on the tag before touching the body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalError};
use crate::histogram::{FloatHistogram, Histogram};
use crate::types::{Labels, SeriesRef, Timestamp};

/// WAL record type, the first byte of every logged record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// New-series declarations
    Series = 1,
    /// Float samples
    Samples = 2,
    /// Deletion intervals; never produced by this engine, skipped on replay
    Tombstones = 3,
    /// Exemplars
    Exemplars = 4,
    /// Integer native-histogram samples
    HistogramSamples = 5,
    /// Float native-histogram samples
    FloatHistogramSamples = 6,
}

impl TryFrom<u8> for RecordType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Series),
            2 => Ok(RecordType::Samples),
            3 => Ok(RecordType::Tombstones),
            4 => Ok(RecordType::Exemplars),
            5 => Ok(RecordType::HistogramSamples),
            6 => Ok(RecordType::FloatHistogramSamples),
            _ => Err(WalError::InvalidRecord(format!(
                "invalid record type: {}",
                value
            ))),
        }
    }
}

/// Declares a series: binds a ref to its label set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    /// Ref the series is known by in sample records
    pub series_ref: SeriesRef,
    /// Full label set of the series
    pub labels: Labels,
}

/// One float sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Ref of the series the sample belongs to
    pub series_ref: SeriesRef,
    /// Sample timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
}

/// One exemplar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemplarRecord {
    /// Ref of the series the exemplar belongs to
    pub series_ref: SeriesRef,
    /// Exemplar timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Exemplar value
    pub value: f64,
    /// Exemplar labels (e.g. trace id)
    pub labels: Labels,
}

/// One integer native-histogram sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSampleRecord {
    /// Ref of the series the sample belongs to
    pub series_ref: SeriesRef,
    /// Sample timestamp in milliseconds
    pub timestamp: Timestamp,
    /// The histogram value
    pub histogram: Histogram,
}

/// One float native-histogram sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatHistogramSampleRecord {
    /// Ref of the series the sample belongs to
    pub series_ref: SeriesRef,
    /// Sample timestamp in milliseconds
    pub timestamp: Timestamp,
    /// The histogram value
    pub histogram: FloatHistogram,
}

/// Encode a series batch into `buf`
pub fn encode_series(series: &[SeriesRecord], buf: &mut Vec<u8>) -> Result<()> {
    encode_body(RecordType::Series, series, buf)
}

/// Encode a float-sample batch into `buf`
pub fn encode_samples(samples: &[SampleRecord], buf: &mut Vec<u8>) -> Result<()> {
    encode_body(RecordType::Samples, samples, buf)
}

/// Encode an exemplar batch into `buf`
pub fn encode_exemplars(exemplars: &[ExemplarRecord], buf: &mut Vec<u8>) -> Result<()> {
    encode_body(RecordType::Exemplars, exemplars, buf)
}

/// Encode an integer-histogram batch into `buf`
pub fn encode_histogram_samples(
    samples: &[HistogramSampleRecord],
    buf: &mut Vec<u8>,
) -> Result<()> {
    encode_body(RecordType::HistogramSamples, samples, buf)
}

/// Encode a float-histogram batch into `buf`
pub fn encode_float_histogram_samples(
    samples: &[FloatHistogramSampleRecord],
    buf: &mut Vec<u8>,
) -> Result<()> {
    encode_body(RecordType::FloatHistogramSamples, samples, buf)
}

/// Read the type tag of an encoded record
pub fn record_type(data: &[u8]) -> Result<RecordType> {
    match data.first() {
        Some(&tag) => RecordType::try_from(tag),
        None => Err(WalError::InvalidRecord("empty record".into())),
    }
}

/// Decode a series batch
pub fn decode_series(data: &[u8]) -> Result<Vec<SeriesRecord>> {
    decode_body(RecordType::Series, data)
}

/// Decode a float-sample batch
pub fn decode_samples(data: &[u8]) -> Result<Vec<SampleRecord>> {
    decode_body(RecordType::Samples, data)
}

/// Decode an exemplar batch
pub fn decode_exemplars(data: &[u8]) -> Result<Vec<ExemplarRecord>> {
    decode_body(RecordType::Exemplars, data)
}

/// Decode an integer-histogram batch
pub fn decode_histogram_samples(data: &[u8]) -> Result<Vec<HistogramSampleRecord>> {
    decode_body(RecordType::HistogramSamples, data)
}

/// Decode a float-histogram batch
pub fn decode_float_histogram_samples(data: &[u8]) -> Result<Vec<FloatHistogramSampleRecord>> {
    decode_body(RecordType::FloatHistogramSamples, data)
}

fn encode_body<T: Serialize>(record_type: RecordType, batch: &[T], buf: &mut Vec<u8>) -> Result<()> {
    buf.push(record_type as u8);
    bincode::serialize_into(&mut *buf, batch)
        .map_err(|e| WalError::InvalidRecord(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(expected: RecordType, data: &[u8]) -> Result<Vec<T>> {
    if record_type(data)? != expected {
        return Err(WalError::InvalidRecord(format!(
            "not a {:?} record",
            expected
        )));
    }
    bincode::deserialize(&data[1..]).map_err(|e| WalError::InvalidRecord(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::BucketSpan;
    use crate::types::stale_nan;

    #[test]
    fn test_series_round_trip() {
        let batch = vec![
            SeriesRecord {
                series_ref: 1,
                labels: Labels::from_pairs([("__name__", "up"), ("job", "node")]),
            },
            SeriesRecord {
                series_ref: 2,
                labels: Labels::from_pairs([("__name__", "up"), ("job", "cadvisor")]),
            },
        ];

        let mut buf = Vec::new();
        encode_series(&batch, &mut buf).unwrap();

        assert_eq!(record_type(&buf).unwrap(), RecordType::Series);
        assert_eq!(decode_series(&buf).unwrap(), batch);
    }

    #[test]
    fn test_sample_values_survive_bit_exact() {
        let batch = vec![SampleRecord {
            series_ref: 9,
            timestamp: 1000,
            value: stale_nan(),
        }];

        let mut buf = Vec::new();
        encode_samples(&batch, &mut buf).unwrap();

        let decoded = decode_samples(&buf).unwrap();
        assert_eq!(decoded[0].value.to_bits(), stale_nan().to_bits());
    }

    #[test]
    fn test_histogram_round_trip() {
        let batch = vec![HistogramSampleRecord {
            series_ref: 3,
            timestamp: 42,
            histogram: Histogram {
                schema: 1,
                zero_threshold: 0.01,
                zero_count: 1,
                count: 4,
                sum: 10.5,
                positive_spans: vec![BucketSpan { offset: 0, length: 2 }],
                positive_deltas: vec![2, -1],
                negative_spans: vec![],
                negative_deltas: vec![],
            },
        }];

        let mut buf = Vec::new();
        encode_histogram_samples(&batch, &mut buf).unwrap();
        assert_eq!(decode_histogram_samples(&buf).unwrap(), batch);
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let mut buf = Vec::new();
        encode_samples(
            &[SampleRecord {
                series_ref: 1,
                timestamp: 1,
                value: 1.0,
            }],
            &mut buf,
        )
        .unwrap();

        assert!(decode_series(&buf).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(record_type(&[200]).is_err());
        assert!(record_type(&[]).is_err());
        assert_eq!(record_type(&[3]).unwrap(), RecordType::Tombstones);
    }
}
