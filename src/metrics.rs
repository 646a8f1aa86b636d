//! Prometheus metrics for graph and work unit execution
//!
//! # Available Metrics
//!
//! - `chainflow_graphs_total{outcome}` - Counter of finished graphs
//! - `chainflow_unit_attempts_total{task, outcome}` - Counter of unit attempts
//! - `chainflow_attempt_duration_seconds{task}` - Histogram of attempt durations
//! - `chainflow_active_graphs` - Gauge of graphs not yet finished
//! - `chainflow_running_units` - Gauge of attempts holding a worker
//!
//! The registry is owned by the engine. Callers render it with
//! [`EngineMetrics::encode`] and expose it however they like.
//!
//! # Example
//!
//! ```
//! use chainflow::metrics::EngineMetrics;
//!
//! let metrics = EngineMetrics::new()?;
//! metrics.record_attempt("fetch-work", "success", 1.5);
//! assert!(metrics.encode()?.contains("chainflow_unit_attempts_total"));
//! # Ok::<(), chainflow::error::ChainFlowError>(())
//! ```

use crate::error::Result;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Histogram bucket boundaries for attempt duration metrics (in seconds)
const ATTEMPT_DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Engine metrics registry
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    graphs: CounterVec,
    attempts: CounterVec,
    attempt_duration: HistogramVec,
    active_graphs: Gauge,
    running_units: Gauge,
}

impl EngineMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let graphs = CounterVec::new(
            Opts::new("chainflow_graphs_total", "Total number of finished graphs"),
            &["outcome"],
        )?;

        let attempts = CounterVec::new(
            Opts::new(
                "chainflow_unit_attempts_total",
                "Total number of work unit attempts",
            ),
            &["task", "outcome"],
        )?;

        let attempt_duration = HistogramVec::new(
            HistogramOpts::new(
                "chainflow_attempt_duration_seconds",
                "Work unit attempt duration in seconds",
            )
            .buckets(ATTEMPT_DURATION_BUCKETS.to_vec()),
            &["task"],
        )?;

        let active_graphs = Gauge::with_opts(Opts::new(
            "chainflow_active_graphs",
            "Graphs not yet finished",
        ))?;

        let running_units = Gauge::with_opts(Opts::new(
            "chainflow_running_units",
            "Work unit attempts currently holding a worker",
        ))?;

        registry.register(Box::new(graphs.clone()))?;
        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(attempt_duration.clone()))?;
        registry.register(Box::new(active_graphs.clone()))?;
        registry.register(Box::new(running_units.clone()))?;

        Ok(Self {
            registry,
            graphs,
            attempts,
            attempt_duration,
            active_graphs,
            running_units,
        })
    }

    /// Record a finished graph
    ///
    /// # Arguments
    ///
    /// * `outcome` - Terminal state label ("succeeded", "failed", "cancelled")
    pub fn record_graph(&self, outcome: &str) {
        self.graphs.with_label_values(&[outcome]).inc();
    }

    /// Record one finished attempt
    ///
    /// # Arguments
    ///
    /// * `task` - Task name
    /// * `outcome` - "success", "retry", "failure", "fault" or "discarded"
    /// * `duration_secs` - Attempt duration in seconds
    pub fn record_attempt(&self, task: &str, outcome: &str, duration_secs: f64) {
        self.attempts.with_label_values(&[task, outcome]).inc();
        self.attempt_duration
            .with_label_values(&[task])
            .observe(duration_secs);
    }

    pub fn inc_active_graphs(&self) {
        self.active_graphs.inc();
    }

    pub fn dec_active_graphs(&self) {
        self.active_graphs.dec();
    }

    pub fn inc_running_units(&self) {
        self.running_units.inc();
    }

    pub fn dec_running_units(&self) {
        self.running_units.dec();
    }

    pub fn active_graphs(&self) -> f64 {
        self.active_graphs.get()
    }

    pub fn running_units(&self) -> f64 {
        self.running_units.get()
    }

    /// Number of recorded attempts of `task` with `outcome`
    pub fn attempt_count(&self, task: &str, outcome: &str) -> u64 {
        self.attempts.with_label_values(&[task, outcome]).get() as u64
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("active_graphs", &self.active_graphs())
            .field("running_units", &self.running_units())
            .finish()
    }
}
