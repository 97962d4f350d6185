//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the vault.
//!
//! # Metrics
//!
//! - `vault_mutations_total` - Committed mutations, by kind
//! - `vault_mutations_rejected_total` - Mutations rejected before any write, by kind
//! - `vault_entries_appended_total` - Ledger entries appended
//! - `vault_mutation_duration_seconds` - Histogram of mutation latencies
//! - `vault_long_polls_total` - Reads that had to suspend
//! - `vault_sequence` - Current sequence counter

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed mutations
    pub mutations_total: IntCounterVec,

    /// Rejected mutations
    pub mutations_rejected: IntCounterVec,

    /// Entries appended
    pub entries_appended: IntCounter,

    /// Mutation duration histogram
    pub mutation_duration: Histogram,

    /// Suspended reads
    pub long_polls_total: IntCounter,

    /// Sequence counter
    pub sequence: IntGauge,

    /// Prometheus registry
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_appended", &self.entries_appended.get())
            .field("sequence", &self.sequence.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total = IntCounterVec::new(
            Opts::new("vault_mutations_total", "Committed mutations"),
            &["kind"],
        )?;
        registry.register(Box::new(mutations_total.clone()))?;

        let mutations_rejected = IntCounterVec::new(
            Opts::new(
                "vault_mutations_rejected_total",
                "Mutations rejected before any write",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(mutations_rejected.clone()))?;

        let entries_appended = IntCounter::new(
            "vault_entries_appended_total",
            "Ledger entries appended",
        )?;
        registry.register(Box::new(entries_appended.clone()))?;

        let mutation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "vault_mutation_duration_seconds",
                "Histogram of mutation latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(mutation_duration.clone()))?;

        let long_polls_total = IntCounter::new(
            "vault_long_polls_total",
            "Reads that suspended until the sequence advanced",
        )?;
        registry.register(Box::new(long_polls_total.clone()))?;

        let sequence = IntGauge::new("vault_sequence", "Current sequence counter")?;
        registry.register(Box::new(sequence.clone()))?;

        Ok(Self {
            mutations_total,
            mutations_rejected,
            entries_appended,
            mutation_duration,
            long_polls_total,
            sequence,
            registry,
        })
    }

    /// Record a committed mutation
    pub fn record_mutation(&self, kind: &str, appended: usize, sequence: u64, duration_seconds: f64) {
        self.mutations_total.with_label_values(&[kind]).inc();
        self.entries_appended.inc_by(appended as u64);
        self.mutation_duration.observe(duration_seconds);
        self.sequence.set(sequence as i64);
    }

    /// Record a rejected mutation
    pub fn record_rejection(&self, kind: &str) {
        self.mutations_rejected.with_label_values(&[kind]).inc();
    }

    /// Record a suspended read
    pub fn record_long_poll(&self) {
        self.long_polls_total.inc();
    }

    /// Set the sequence gauge (startup, rebuild)
    pub fn set_sequence(&self, sequence: u64) {
        self.sequence.set(sequence as i64);
    }

    /// Render in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.entries_appended.get(), 0);
        assert_eq!(metrics.long_polls_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_long_poll();
        assert_eq!(a.long_polls_total.get(), 1);
        assert_eq!(b.long_polls_total.get(), 0);
    }

    #[test]
    fn test_record_mutation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_mutation("post_transactions", 2, 4, 0.002);
        metrics.record_mutation("register", 1, 5, 0.001);

        assert_eq!(metrics.entries_appended.get(), 3);
        assert_eq!(metrics.sequence.get(), 5);
        assert_eq!(
            metrics.mutations_total.with_label_values(&["register"]).get(),
            1
        );
    }

    #[test]
    fn test_render_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection("register");
        let text = metrics.render().unwrap();
        assert!(text.contains("vault_mutations_rejected_total{kind=\"register\"} 1"));
    }
}
