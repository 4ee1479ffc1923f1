//! Storage self-instrumentation

use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::error::Result;

/// Counters and gauges the storage maintains about itself.
///
/// Instruments work whether or not a registry was supplied; without one
/// they are never exported but still drive the same code paths.
pub(crate) struct StorageMetrics {
    registry: Option<Registry>,

    pub(crate) active_series: IntGauge,
    pub(crate) deleted_series: IntGauge,
    pub(crate) created_series: IntCounter,
    pub(crate) removed_series: IntCounter,
    pub(crate) out_of_order_samples: IntCounter,
    pub(crate) samples_appended: IntCounter,
    pub(crate) exemplars_appended: IntCounter,
}

impl StorageMetrics {
    pub(crate) fn new(registry: Option<&Registry>) -> Result<Self> {
        let active_series = IntGauge::with_opts(Opts::new(
            "siphon_wal_storage_active_series",
            "Current number of active series being tracked by the WAL storage",
        ))?;
        let deleted_series = IntGauge::with_opts(Opts::new(
            "siphon_wal_storage_deleted_series",
            "Current number of series marked for deletion from memory",
        ))?;
        let created_series = IntCounter::with_opts(Opts::new(
            "siphon_wal_storage_created_series_total",
            "Total number of created series appended to the WAL",
        ))?;
        let removed_series = IntCounter::with_opts(Opts::new(
            "siphon_wal_storage_removed_series_total",
            "Total number of series removed from the WAL",
        ))?;
        let out_of_order_samples = IntCounter::with_opts(Opts::new(
            "siphon_wal_out_of_order_samples_total",
            "Total number of out of order samples ingestion failed attempts",
        ))?;
        let samples_appended = IntCounter::with_opts(Opts::new(
            "siphon_wal_samples_appended_total",
            "Total number of samples appended to the WAL",
        ))?;
        let exemplars_appended = IntCounter::with_opts(Opts::new(
            "siphon_wal_exemplars_appended_total",
            "Total number of exemplars appended to the WAL",
        ))?;

        if let Some(registry) = registry {
            registry.register(Box::new(active_series.clone()))?;
            registry.register(Box::new(deleted_series.clone()))?;
            registry.register(Box::new(created_series.clone()))?;
            registry.register(Box::new(removed_series.clone()))?;
            registry.register(Box::new(out_of_order_samples.clone()))?;
            registry.register(Box::new(samples_appended.clone()))?;
            registry.register(Box::new(exemplars_appended.clone()))?;
        }

        Ok(Self {
            registry: registry.cloned(),
            active_series,
            deleted_series,
            created_series,
            removed_series,
            out_of_order_samples,
            samples_appended,
            exemplars_appended,
        })
    }

    /// Remove the instruments from the registry they were registered with.
    /// Failures are ignored; an instrument may already be gone.
    pub(crate) fn unregister(&self) {
        if let Some(registry) = &self.registry {
            let _ = registry.unregister(Box::new(self.active_series.clone()));
            let _ = registry.unregister(Box::new(self.deleted_series.clone()));
            let _ = registry.unregister(Box::new(self.created_series.clone()));
            let _ = registry.unregister(Box::new(self.removed_series.clone()));
            let _ = registry.unregister(Box::new(self.out_of_order_samples.clone()));
            let _ = registry.unregister(Box::new(self.samples_appended.clone()));
            let _ = registry.unregister(Box::new(self.exemplars_appended.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = Registry::new();
        let metrics = StorageMetrics::new(Some(&registry)).unwrap();

        metrics.active_series.set(3);
        metrics.samples_appended.inc();

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "siphon_wal_storage_active_series"));

        metrics.unregister();
        assert!(registry.gather().is_empty());
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = StorageMetrics::new(Some(&registry)).unwrap();
        assert!(StorageMetrics::new(Some(&registry)).is_err());
    }

    #[test]
    fn test_works_without_registry() {
        let metrics = StorageMetrics::new(None).unwrap();
        metrics.active_series.inc();
        metrics.out_of_order_samples.inc();
        assert_eq!(metrics.active_series.get(), 1);
    }
}
