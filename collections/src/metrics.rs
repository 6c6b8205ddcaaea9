//! Metrics collection for observability
//!
//! Prometheus metrics for the collection pipeline.
//!
//! # Metrics
//!
//! - `collections_batches_created_total` - Batches produced by the optimizer
//! - `collections_batches_settled_total` - Batches fully settled
//! - `collections_batches_partially_failed_total` - Batches with at least one failed entry
//! - `collections_entries_submitted_total` - Debit instructions sent to the bank
//! - `collections_entries_collected_total` - Instructions confirmed collected
//! - `collections_entries_returned_total` - Instructions returned by the debtor bank
//! - `collections_retries_scheduled_total` - Retries placed on the backoff schedule
//! - `collections_retries_exhausted_total` - Invoices that ran out of attempts
//! - `collections_reconciliation_anomalies_total` - Unmatched return records
//! - `collections_amount_collected_eur` - Running sum of collected amounts

use prometheus::{Counter, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Each instance carries its own registry so independent engines (and
/// tests) never collide on metric names.
#[derive(Clone)]
pub struct Metrics {
    /// Batches produced by the optimizer
    pub batches_created: IntCounter,

    /// Batches fully settled
    pub batches_settled: IntCounter,

    /// Batches with at least one failed entry
    pub batches_partially_failed: IntCounter,

    /// Debit instructions submitted
    pub entries_submitted: IntCounter,

    /// Instructions confirmed collected
    pub entries_collected: IntCounter,

    /// Instructions returned by the debtor bank
    pub entries_returned: IntCounter,

    /// Retries placed on the backoff schedule
    pub retries_scheduled: IntCounter,

    /// Invoices that ran out of attempts
    pub retries_exhausted: IntCounter,

    /// Unmatched return records
    pub reconciliation_anomalies: IntCounter,

    /// Running sum of collected amounts in EUR
    pub amount_collected: Counter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        fn int_counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        }

        let batches_created = int_counter(
            &registry,
            "collections_batches_created_total",
            "Batches produced by the optimizer",
        )?;
        let batches_settled = int_counter(
            &registry,
            "collections_batches_settled_total",
            "Batches fully settled",
        )?;
        let batches_partially_failed = int_counter(
            &registry,
            "collections_batches_partially_failed_total",
            "Batches with at least one failed entry",
        )?;
        let entries_submitted = int_counter(
            &registry,
            "collections_entries_submitted_total",
            "Debit instructions sent to the bank",
        )?;
        let entries_collected = int_counter(
            &registry,
            "collections_entries_collected_total",
            "Instructions confirmed collected",
        )?;
        let entries_returned = int_counter(
            &registry,
            "collections_entries_returned_total",
            "Instructions returned by the debtor bank",
        )?;
        let retries_scheduled = int_counter(
            &registry,
            "collections_retries_scheduled_total",
            "Retries placed on the backoff schedule",
        )?;
        let retries_exhausted = int_counter(
            &registry,
            "collections_retries_exhausted_total",
            "Invoices that ran out of attempts",
        )?;
        let reconciliation_anomalies = int_counter(
            &registry,
            "collections_reconciliation_anomalies_total",
            "Unmatched return records",
        )?;

        let amount_collected = Counter::with_opts(Opts::new(
            "collections_amount_collected_eur",
            "Running sum of collected amounts in EUR",
        ))?;
        registry.register(Box::new(amount_collected.clone()))?;

        Ok(Self {
            batches_created,
            batches_settled,
            batches_partially_failed,
            entries_submitted,
            entries_collected,
            entries_returned,
            retries_scheduled,
            retries_exhausted,
            reconciliation_anomalies,
            amount_collected,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
