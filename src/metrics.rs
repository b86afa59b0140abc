use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime metrics for the collector.
///
/// Purpose:
/// - Track cycle outcomes
/// - Track per-source success / failure counts
/// - Track delivery throughput and errors
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Cycles
    pub cycles_started: AtomicUsize,
    pub cycles_delivered: AtomicUsize,
    pub cycle_failures: AtomicUsize,
    pub tick_panics: AtomicUsize,
    pub backoffs: AtomicUsize,

    // Sources
    pub source_successes: AtomicUsize,
    pub source_failures: AtomicUsize,

    // Delivery
    pub envelopes_sent: AtomicUsize,
    pub delivery_errors: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// One-line summary for the periodic reporter.
    pub fn summary(&self) -> String {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "cycles={} delivered={} failed={} panics={} backoffs={} src_ok={} src_err={} envelopes={} delivery_err={}",
            get(&self.cycles_started),
            get(&self.cycles_delivered),
            get(&self.cycle_failures),
            get(&self.tick_panics),
            get(&self.backoffs),
            get(&self.source_successes),
            get(&self.source_failures),
            get(&self.envelopes_sent),
            get(&self.delivery_errors),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
