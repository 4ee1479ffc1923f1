//! Core model types: series identity, label sets, exemplars, stale markers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Process-local identity of a tracked series; assignment starts at 1 and
/// never repeats for the lifetime of a `Storage`. 0 means "no series".
pub type SeriesRef = u64;

/// Bit pattern of the stale-marker NaN appended when a series stops
/// producing data
const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// The stale-marker sample value
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Check whether a value is the stale marker (an ordinary NaN is not)
pub fn is_stale_nan(value: f64) -> bool {
    value.to_bits() == STALE_NAN_BITS
}

/// Wall-clock milliseconds since Unix epoch
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A single name/value pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

/// An immutable label set identifying one series, kept sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Create an empty label set
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a label set from name/value pairs; sorts by name
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Self(labels)
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the set has no labels
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over labels in name order
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Get the value for a label name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Copy of the set with empty-valued labels removed
    pub fn without_empty(&self) -> Labels {
        Self(self.0.iter().filter(|l| !l.value.is_empty()).cloned().collect())
    }

    /// First label name that appears more than once, if any
    pub fn duplicate_name(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|w| w[0].name == w[1].name)
            .map(|w| w[0].name.as_str())
    }

    /// Combined character count of all names and values
    pub fn char_len(&self) -> usize {
        self.0
            .iter()
            .map(|l| l.name.chars().count() + l.value.chars().count())
            .sum()
    }

    /// Stable 64-bit hash of the label set, used for stripe selection
    pub fn hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::Hasher;

        let mut h = DefaultHasher::new();
        for l in &self.0 {
            h.write(l.name.as_bytes());
            h.write_u8(0xff);
            h.write(l.value.as_bytes());
            h.write_u8(0xff);
        }
        h.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", l.name, l.value)?;
        }
        write!(f, "}}")
    }
}

/// A sampled trace/example point attached to a metric sample; at most one
/// "latest" exemplar is cached per series for de-duplication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exemplar {
    /// Labels carried by the exemplar (e.g. a trace id)
    pub labels: Labels,
    /// Observed value
    pub value: f64,
    /// Observation timestamp in milliseconds
    pub timestamp: Timestamp,
}

impl PartialEq for Exemplar {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
            && self.timestamp == other.timestamp
            && (self.value == other.value || (self.value.is_nan() && other.value.is_nan()))
    }
}

/// Metric type reported alongside metadata updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    GaugeHistogram,
    Summary,
    Info,
    Stateset,
    Unknown,
}

/// Metadata attached to a metric family; accepted by the appender but
/// never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricMetadata {
    /// Type of the metric family
    pub metric_type: MetricType,
    /// Unit of the recorded values
    pub unit: String,
    /// Help text
    pub help: String,
}
