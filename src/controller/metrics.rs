//! Controller Metrics
//!
//! Prometheus instruments for reconciles, garbage collection and replica
//! management.

use crate::error::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Metrics shared by all controllers
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconciles by kind and result
    pub reconciles: IntCounterVec,
    /// Reconcile latency by kind
    pub reconcile_duration: HistogramVec,
    /// Garbage collection events (scheduled, cancelled, fired)
    pub gc_events: IntCounterVec,
    /// Outstanding garbage collections
    pub gc_pending: IntGauge,
    /// Replica attachments created
    pub replicas_created: IntCounter,
    /// Replacement tasks by outcome
    pub replica_replacements: IntCounterVec,
}

impl ControllerMetrics {
    /// Create the instruments and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new(
                "volume_operator_reconciles_total",
                "Reconciles by kind and result",
            ),
            &["kind", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "volume_operator_reconcile_duration_seconds",
                "Duration of reconciles",
            ),
            &["kind"],
        )?;
        let gc_events = IntCounterVec::new(
            Opts::new(
                "volume_operator_gc_events_total",
                "Garbage collection scheduling events",
            ),
            &["event"],
        )?;
        let gc_pending = IntGauge::new(
            "volume_operator_gc_pending",
            "Garbage collections waiting for their grace interval",
        )?;
        let replicas_created = IntCounter::new(
            "volume_operator_replicas_created_total",
            "Replica attachments created",
        )?;
        let replica_replacements = IntCounterVec::new(
            Opts::new(
                "volume_operator_replica_replacements_total",
                "Replica replacement tasks by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(gc_events.clone()))?;
        registry.register(Box::new(gc_pending.clone()))?;
        registry.register(Box::new(replicas_created.clone()))?;
        registry.register(Box::new(replica_replacements.clone()))?;

        Ok(Self {
            reconciles,
            reconcile_duration,
            gc_events,
            gc_pending,
            replicas_created,
            replica_replacements,
        })
    }

    /// Record the outcome of one reconcile
    pub fn observe_reconcile(&self, kind: &str, ok: bool, seconds: f64) {
        let result = if ok { "success" } else { "error" };
        self.reconciles.with_label_values(&[kind, result]).inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .observe(seconds);
    }
}
