//! Controller metrics.
//!
//! One registry per process, owned by the controller context and served on
//! the settings object's metrics port.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    reconciles_total: IntCounterVec,
    reconcile_duration: Histogram,
    resource_writes_total: IntCounterVec,
    queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("monitoring".to_string()), None)?;

        let reconciles_total = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile passes grouped by result"),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Duration of reconcile passes")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let resource_writes_total = IntCounterVec::new(
            Opts::new("resource_writes_total", "Writes to owned objects grouped by kind and operation"),
            &["kind", "op"],
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Keys waiting in the work queue")?;

        registry.register(Box::new(reconciles_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(resource_writes_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciles_total,
            reconcile_duration,
            resource_writes_total,
            queue_depth,
        })
    }

    pub fn observe_reconcile(&self, result: &str, elapsed: Duration) {
        self.reconciles_total.with_label_values(&[result]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_write(&self, kind: &str, op: &str) {
        self.resource_writes_total.with_label_values(&[kind, op]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    #[cfg(test)]
    pub fn writes(&self, kind: &str, op: &str) -> u64 {
        self.resource_writes_total.with_label_values(&[kind, op]).get()
    }

    /// Text exposition format.
    pub fn gather(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
