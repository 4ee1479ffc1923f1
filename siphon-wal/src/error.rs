//! Error types for the Siphon WAL engine

use std::path::PathBuf;

use thiserror::Error;

use crate::histogram::HistogramError;
use crate::types::SeriesRef;

/// Result type alias for WAL operations
pub type Result<T> = std::result::Result<T, WalError>;

/// Siphon WAL error types
#[derive(Error, Debug)]
pub enum WalError {
    /// Storage was closed before the operation started
    #[error("WAL storage closed")]
    Closed,

    /// Close was called on an already-closed storage
    #[error("already closed")]
    AlreadyClosed,

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected at a known position in the log
    #[error("corruption in {} segment {segment} at offset {offset}: {reason}", dir.display())]
    Corruption {
        /// Directory of the log the corrupt segment belongs to
        dir: PathBuf,
        /// Segment index containing the corrupt frame
        segment: u64,
        /// Byte offset of the corrupt frame within the segment
        offset: u64,
        /// What failed to decode
        reason: String,
    },

    /// Record payload failed to encode or decode
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Log repair was attempted for an error it cannot handle
    #[error("repair failed: {0}")]
    Repair(String),

    /// Sample rejected before staging (bad label set)
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// Exemplar rejected before staging
    #[error("invalid exemplar: {0}")]
    InvalidExemplar(String),

    /// Exemplar label set longer than the configured maximum
    #[error("exemplar labels have a combined length of more than {0} characters")]
    ExemplarLabelLength(usize),

    /// Histogram failed structural validation
    #[error("invalid histogram: {0}")]
    InvalidHistogram(#[from] HistogramError),

    /// Exemplar references a series that is not in the index
    #[error("unknown series ref {0}")]
    UnknownSeries(SeriesRef),

    /// Metrics registry rejected an instrument
    #[error("metrics registration: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl WalError {
    /// Check if error indicates log corruption (repairable during replay)
    pub fn is_corruption(&self) -> bool {
        matches!(self, WalError::Corruption { .. })
    }
}
