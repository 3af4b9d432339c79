//! Throughput accounting.
//!
//! Every worker increments one shared [`Accumulator`] per metric generated.
//! Once the coordinator has joined all workers it reads the total once and
//! turns it into a [`Report`].
//!
//! Metrics are counted when generated, not when transmitted. Lines still
//! sitting in a batch buffer at the deadline, and lines in a batch whose
//! transmission failed, are included. The reported rate is therefore the rate
//! at which the benchmark intended to send, not a delivery guarantee.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

#[derive(Debug, Clone, Default)]
/// The shared count of metrics generated across all workers.
///
/// Clones share the same counter.
pub struct Accumulator {
    inner: Arc<AtomicU64>,
}

impl Accumulator {
    /// Create a new, zeroed, [`Accumulator`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one generated metric.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Record `n` generated metrics.
    #[inline]
    pub fn add(&self, n: u64) {
        // Relaxed is sufficient, the total is only read after every writer has
        // been joined and the join establishes happens-before.
        self.inner.fetch_add(n, Ordering::Relaxed);
    }

    /// Current total.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The outcome of a completed run.
pub struct Report {
    /// Metrics generated across every worker.
    pub total: u64,
    /// The configured run duration. Must be non-zero.
    pub duration: Duration,
    /// Metrics generated by each worker, in the order workers were joined.
    pub per_worker: Vec<u64>,
}

impl Report {
    /// Metrics generated per second of configured duration.
    #[must_use]
    pub fn per_second(&self) -> f64 {
        self.total as f64 / self.duration.as_secs_f64()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "metrics sent: {}", self.total)?;
        write!(f, "metrics per second: {:.2}", self.per_second())
    }
}
