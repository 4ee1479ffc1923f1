//! Native histogram sample values and their structural validation

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a histogram fails structural validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistogramError {
    /// A span after the first has a negative offset
    #[error("span number {span} with offset {offset}")]
    SpanNegativeOffset { span: usize, offset: i32 },

    /// Total span length disagrees with the bucket list length
    #[error("spans need {spans} buckets, have {buckets} buckets")]
    SpansBucketsMismatch { spans: usize, buckets: usize },

    /// A bucket resolves to a negative observation count
    #[error("bucket number {bucket} has a negative observation count")]
    NegativeBucketCount { bucket: usize },

    /// Bucket totals disagree with the count field
    #[error("{observed} observations found in buckets, but the count field is {count}")]
    CountMismatch { observed: f64, count: f64 },

    /// Bucket totals exceed the count field (only checked when sum is NaN)
    #[error("{observed} observations found in buckets exceed the count field {count}")]
    CountNotBigEnough { observed: f64, count: f64 },
}

/// Layout of consecutive histogram buckets: `offset` empty buckets before
/// `length` used ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpan {
    /// Gap to the previous span (may be negative only on the first span)
    pub offset: i32,
    /// Number of consecutive buckets covered
    pub length: u32,
}

/// A native histogram with integer bucket counts, delta-encoded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Resolution schema; bucket boundaries grow by 2^(2^-schema)
    pub schema: i32,
    /// Width of the zero bucket
    pub zero_threshold: f64,
    /// Observations inside the zero bucket
    pub zero_count: u64,
    /// Total observation count
    pub count: u64,
    /// Sum of all observed values
    pub sum: f64,
    /// Span layout of the positive buckets
    pub positive_spans: Vec<BucketSpan>,
    /// Positive bucket counts as deltas to the previous bucket
    pub positive_deltas: Vec<i64>,
    /// Span layout of the negative buckets
    pub negative_spans: Vec<BucketSpan>,
    /// Negative bucket counts as deltas to the previous bucket
    pub negative_deltas: Vec<i64>,
}

/// A native histogram with absolute float bucket counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloatHistogram {
    /// Resolution schema; bucket boundaries grow by 2^(2^-schema)
    pub schema: i32,
    /// Width of the zero bucket
    pub zero_threshold: f64,
    /// Observations inside the zero bucket
    pub zero_count: f64,
    /// Total observation count
    pub count: f64,
    /// Sum of all observed values
    pub sum: f64,
    /// Span layout of the positive buckets
    pub positive_spans: Vec<BucketSpan>,
    /// Absolute positive bucket counts
    pub positive_buckets: Vec<f64>,
    /// Span layout of the negative buckets
    pub negative_spans: Vec<BucketSpan>,
    /// Absolute negative bucket counts
    pub negative_buckets: Vec<f64>,
}

/// Either flavor of histogram sample accepted by the appender
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramValue {
    /// Integer bucket counts
    Integer(Histogram),
    /// Float bucket counts
    Float(FloatHistogram),
}

impl HistogramValue {
    /// Run structural validation for the wrapped histogram
    pub fn validate(&self) -> Result<(), HistogramError> {
        match self {
            HistogramValue::Integer(h) => h.validate(),
            HistogramValue::Float(fh) => fh.validate(),
        }
    }
}

impl Histogram {
    /// Validate span layout, bucket counts, and the count field
    pub fn validate(&self) -> Result<(), HistogramError> {
        check_spans(&self.negative_spans, self.negative_deltas.len())?;
        check_spans(&self.positive_spans, self.positive_deltas.len())?;

        let negative = check_delta_buckets(&self.negative_deltas)?;
        let positive = check_delta_buckets(&self.positive_deltas)?;

        let observed = negative + positive + self.zero_count;
        if self.sum.is_nan() {
            // NaN sum means some observations never reached a bucket, so the
            // count field is only a lower bound for the bucket totals.
            if observed > self.count {
                return Err(HistogramError::CountNotBigEnough {
                    observed: observed as f64,
                    count: self.count as f64,
                });
            }
        } else if observed != self.count {
            return Err(HistogramError::CountMismatch {
                observed: observed as f64,
                count: self.count as f64,
            });
        }
        Ok(())
    }
}

impl FloatHistogram {
    /// Validate span layout, bucket counts, and the count field
    pub fn validate(&self) -> Result<(), HistogramError> {
        check_spans(&self.negative_spans, self.negative_buckets.len())?;
        check_spans(&self.positive_spans, self.positive_buckets.len())?;

        let negative = check_float_buckets(&self.negative_buckets)?;
        let positive = check_float_buckets(&self.positive_buckets)?;

        let observed = negative + positive + self.zero_count;
        if self.sum.is_nan() {
            if observed > self.count {
                return Err(HistogramError::CountNotBigEnough {
                    observed,
                    count: self.count,
                });
            }
        } else if observed != self.count {
            return Err(HistogramError::CountMismatch {
                observed,
                count: self.count,
            });
        }
        Ok(())
    }
}

fn check_spans(spans: &[BucketSpan], buckets: usize) -> Result<(), HistogramError> {
    let mut span_buckets = 0usize;
    for (i, span) in spans.iter().enumerate() {
        if i > 0 && span.offset < 0 {
            return Err(HistogramError::SpanNegativeOffset {
                span: i + 1,
                offset: span.offset,
            });
        }
        span_buckets += span.length as usize;
    }
    if span_buckets != buckets {
        return Err(HistogramError::SpansBucketsMismatch {
            spans: span_buckets,
            buckets,
        });
    }
    Ok(())
}

fn check_delta_buckets(deltas: &[i64]) -> Result<u64, HistogramError> {
    let mut last = 0i64;
    let mut total = 0u64;
    for (i, delta) in deltas.iter().enumerate() {
        let count = last + delta;
        if count < 0 {
            return Err(HistogramError::NegativeBucketCount { bucket: i + 1 });
        }
        last = count;
        total += count as u64;
    }
    Ok(total)
}

fn check_float_buckets(buckets: &[f64]) -> Result<f64, HistogramError> {
    let mut total = 0f64;
    for (i, bucket) in buckets.iter().enumerate() {
        if *bucket < 0.0 {
            return Err(HistogramError::NegativeBucketCount { bucket: i + 1 });
        }
        total += bucket;
    }
    Ok(total)
}
