//! Siphon WAL - Durable Time-Series Buffer for the Siphon Agent
//!
//! A write-ahead-log backed metrics buffer optimized for:
//! - Crash-safe buffering between scrape and remote delivery
//! - Bounded disk usage through periodic checkpoint and truncation
//! - Cheap concurrent appends via a striped in-memory series index
//!
//! # Architecture
//!
//! Samples flow through three cooperating layers:
//!
//! - **Segment log**: append-only, CRC-protected frames in numbered
//!   segment files; the durability boundary
//! - **Series index**: striped in-memory map binding label sets to refs,
//!   garbage collected once series stop receiving data
//! - **Checkpoints**: filtered rewrites of old segments so replay cost
//!   stays proportional to live data, not to history

pub mod record;
pub mod storage;
pub mod wlog;

mod error;
mod histogram;
mod metrics;
mod types;

pub use error::{Result, WalError};
pub use histogram::{BucketSpan, FloatHistogram, Histogram, HistogramError, HistogramValue};
pub use storage::{wal_sub_directory, Appender, Storage};
pub use types::*;

/// Siphon WAL version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// WAL segment size (128MB)
    pub const WAL_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

    /// Number of stripes in the in-memory series index
    pub const STRIPE_SIZE: usize = 16 * 1024;

    /// Combined character limit for an exemplar's label names and values
    pub const EXEMPLAR_MAX_LABEL_SET_LENGTH: usize = 128;

    /// How often the consumer position is re-read while waiting for
    /// staleness markers to be delivered
    pub const STALENESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// How long to wait for staleness markers to be delivered before
    /// giving up
    pub const STALENESS_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
}
