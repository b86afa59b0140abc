use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::time::{Duration, Instant, sleep};

use crate::metrics::{METRICS, RuntimeMetrics};
use crate::quality::QualityMonitor;
use crate::schema::CheckStatus;
use crate::sink::Deliver;
use crate::util::panic_message;

use super::orchestrator::Collect;

/// Cycle pacing.
///
/// Both values come from configuration; tests inject short ones
/// and run on a paused clock.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    /// Target period between cycle starts
    pub interval: Duration,

    /// Fixed delay after a failed cycle
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Backoff,
}

/// Where inside a tick a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Collect,
    Deliver,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Collect => write!(f, "collect"),
            Stage::Deliver => write!(f, "deliver"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Delivered { envelopes: usize, elapsed: Duration },
    Failed { stage: Stage, error: String },
}

/// Sleep before the next cycle: `max(0, interval - elapsed)`.
///
/// A cycle that overran its interval is followed immediately by the
/// next one. Nothing is anchored to a schedule, so overruns never
/// accumulate.
pub fn pacing_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// RUNNING ⇄ BACKOFF transition for a tick outcome.
pub fn transition(outcome: &TickOutcome) -> LoopState {
    match outcome {
        TickOutcome::Delivered { .. } => LoopState::Running,
        TickOutcome::Failed { .. } => LoopState::Backoff,
    }
}

/// ============================================================
/// CollectionLoop
/// ============================================================
///
/// Drives `collect -> deliver -> pace` forever.
///
/// CONTRACT:
/// - Cycles never overlap
/// - A tick never propagates an error or a panic
/// - A failed tick is not retried; the next tick is a fresh cycle
///
/// Only startup configuration errors stop the process, and those
/// happen before a loop exists.
pub struct CollectionLoop<C, D> {
    collector: C,
    sink: D,
    timing: LoopTiming,
    state: LoopState,
    quality: Option<QualityMonitor>,
}

impl<C: Collect, D: Deliver> CollectionLoop<C, D> {
    pub fn new(collector: C, sink: D, timing: LoopTiming) -> Self {
        Self {
            collector,
            sink,
            timing,
            state: LoopState::Running,
            quality: None,
        }
    }

    pub fn with_quality(mut self, monitor: QualityMonitor) -> Self {
        self.quality = Some(monitor);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// One cycle, without pacing.
    pub async fn tick(&mut self) -> TickOutcome {
        RuntimeMetrics::incr(&METRICS.cycles_started);
        let started = Instant::now();

        let record = match AssertUnwindSafe(self.collector.collect()).catch_unwind().await {
            Ok(record) => record,
            Err(panic) => return panicked(Stage::Collect, panic),
        };

        let envelopes = match AssertUnwindSafe(self.sink.deliver(&record)).catch_unwind().await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                RuntimeMetrics::incr(&METRICS.cycle_failures);
                return TickOutcome::Failed {
                    stage: Stage::Deliver,
                    error: e.to_string(),
                };
            }
            Err(panic) => return panicked(Stage::Deliver, panic),
        };

        RuntimeMetrics::incr(&METRICS.cycles_delivered);
        let elapsed = started.elapsed();

        log::info!(
            "Cycle {} complete: {}/{} sources ok, {} envelopes, {:.2?}",
            record.timestamp,
            record.succeeded(),
            record.slots.len(),
            envelopes,
            elapsed
        );
        for error in &record.errors {
            log::debug!("  source error: {}", error);
        }

        if let Some(monitor) = self.quality.as_mut() {
            let checked = std::panic::catch_unwind(AssertUnwindSafe(|| {
                monitor.observe(&record);
                if monitor.due() {
                    report_quality(monitor);
                }
            }));
            if let Err(panic) = checked {
                RuntimeMetrics::incr(&METRICS.tick_panics);
                log::error!("[quality] checks panicked: {}", panic_message(panic.as_ref()));
            }
        }

        TickOutcome::Delivered { envelopes, elapsed }
    }

    /// Tick, then sleep according to the resulting state.
    pub async fn step(&mut self) -> TickOutcome {
        let outcome = self.tick().await;
        self.state = transition(&outcome);

        match (self.state, &outcome) {
            (LoopState::Running, TickOutcome::Delivered { elapsed, .. }) => {
                sleep(pacing_delay(self.timing.interval, *elapsed)).await;
            }
            (LoopState::Backoff, TickOutcome::Failed { stage, error }) => {
                RuntimeMetrics::incr(&METRICS.backoffs);
                log::error!(
                    "Cycle failed during {}: {}; backing off {:?}",
                    stage,
                    error,
                    self.timing.backoff
                );
                sleep(self.timing.backoff).await;
                self.state = LoopState::Running;
            }
            _ => {}
        }

        outcome
    }

    /// Runs until the future is dropped.
    pub async fn run(&mut self) {
        log::info!(
            "Collection loop started (interval {:?}, backoff {:?})",
            self.timing.interval,
            self.timing.backoff
        );
        loop {
            self.step().await;
        }
    }
}

fn panicked(stage: Stage, panic: Box<dyn Any + Send>) -> TickOutcome {
    RuntimeMetrics::incr(&METRICS.tick_panics);
    RuntimeMetrics::incr(&METRICS.cycle_failures);

    TickOutcome::Failed {
        stage,
        error: format!("panic: {}", panic_message(panic.as_ref())),
    }
}

fn report_quality(monitor: &QualityMonitor) {
    for result in monitor.evaluate(chrono::Utc::now()) {
        match result.status {
            CheckStatus::Pass => log::info!("[quality] {} PASS: {}", result.check, result.message),
            CheckStatus::Fail => log::warn!("[quality] {} FAIL: {}", result.check, result.message),
            CheckStatus::Error => log::error!("[quality] {} ERROR: {}", result.check, result.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvelopeMode, QualityConfig};
    use crate::error::DeliveryError;
    use crate::schema::CombinedRecord;
    use crate::sink::envelope::EnvelopeBuilder;
    use crate::sink::tests::RecordingProducer;
    use crate::sink::DeliveryAdapter;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeCollector {
        delay: Duration,
        panic: bool,
    }

    #[async_trait::async_trait]
    impl Collect for FakeCollector {
        async fn collect(&self) -> CombinedRecord {
            sleep(self.delay).await;
            if self.panic {
                panic!("collector exploded");
            }
            CombinedRecord::new(crate::util::now_rfc3339())
        }
    }

    fn collector(secs: u64) -> FakeCollector {
        FakeCollector {
            delay: Duration::from_secs(secs),
            panic: false,
        }
    }

    /// Sink replaying scripted results, then succeeding.
    #[derive(Default)]
    struct ScriptedSink {
        script: Mutex<VecDeque<Result<usize, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSink {
        fn failing_once() -> Self {
            let sink = Self::default();
            sink.script.lock().unwrap().push_back(Err("connection refused".into()));
            sink
        }
    }

    #[async_trait::async_trait]
    impl Deliver for Arc<ScriptedSink> {
        async fn deliver(&self, _record: &CombinedRecord) -> Result<usize, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Err(detail)) => Err(DeliveryError::Sink { sink: "scripted", detail }),
                Some(Ok(n)) => Ok(n),
                None => Ok(1),
            }
        }
    }

    fn timing() -> LoopTiming {
        LoopTiming {
            interval: Duration::from_secs(10),
            backoff: Duration::from_secs(5),
        }
    }

    fn assert_secs(elapsed: Duration, secs: u64) {
        let want = Duration::from_secs(secs);
        assert!(
            elapsed >= want && elapsed < want + Duration::from_millis(100),
            "elapsed {:?}, expected ~{:?}",
            elapsed,
            want
        );
    }

    #[test]
    fn pacing_floors_at_zero() {
        let interval = Duration::from_secs(10);
        assert_eq!(pacing_delay(interval, Duration::from_secs(3)), Duration::from_secs(7));
        assert_eq!(pacing_delay(interval, Duration::from_secs(10)), Duration::ZERO);
        assert_eq!(pacing_delay(interval, Duration::from_secs(25)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_backs_off_without_retrying() {
        let sink = Arc::new(ScriptedSink::failing_once());
        let mut lp = CollectionLoop::new(collector(0), sink.clone(), timing());

        let started = Instant::now();
        let outcome = lp.step().await;

        assert!(matches!(
            outcome,
            TickOutcome::Failed { stage: Stage::Deliver, ref error } if error.contains("connection refused")
        ));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_secs(started.elapsed(), 5);
        assert_eq!(lp.state(), LoopState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn next_tick_after_backoff_starts_clean() {
        let sink = Arc::new(ScriptedSink::failing_once());
        let mut lp = CollectionLoop::new(collector(0), sink.clone(), timing());

        let started = Instant::now();
        assert!(matches!(lp.step().await, TickOutcome::Failed { .. }));
        assert!(matches!(lp.step().await, TickOutcome::Delivered { envelopes: 1, .. }));

        // 5s backoff + 10s pacing
        assert_secs(started.elapsed(), 15);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_starts_next_one_immediately() {
        let sink = Arc::new(ScriptedSink::default());
        let mut lp = CollectionLoop::new(collector(12), sink, timing());

        let started = Instant::now();
        let outcome = lp.step().await;

        let TickOutcome::Delivered { elapsed, .. } = outcome else {
            panic!("expected delivery, got {:?}", outcome);
        };
        assert_secs(elapsed, 12);
        assert_secs(started.elapsed(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_collector_is_contained() {
        let sink = Arc::new(ScriptedSink::default());
        let mut lp = CollectionLoop::new(
            FakeCollector {
                delay: Duration::ZERO,
                panic: true,
            },
            sink.clone(),
            timing(),
        );

        let outcome = lp.tick().await;

        assert_eq!(transition(&outcome), LoopState::Backoff);
        let TickOutcome::Failed { stage, error } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Collect);
        assert!(error.contains("collector exploded"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_cycle_reaches_the_producer() {
        let producer = Arc::new(RecordingProducer::default());
        let adapter = DeliveryAdapter::new(
            producer.clone(),
            EnvelopeBuilder::new(EnvelopeMode::Combined, 10),
            false,
        );
        let mut lp = CollectionLoop::new(collector(2), adapter, timing());

        let started = Instant::now();
        let outcome = lp.step().await;

        assert!(matches!(outcome, TickOutcome::Delivered { envelopes: 1, .. }));
        assert_eq!(producer.batches.lock().unwrap().len(), 1);
        // 2s of work + 8s pacing
        assert_secs(started.elapsed(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn quality_checks_with_huge_windows_keep_the_cycle_delivered() {
        let sink = Arc::new(ScriptedSink::default());
        let quality = QualityMonitor::new(QualityConfig {
            every_cycles: 1,
            max_age_minutes: 200_000_000_000,
            completeness_window_minutes: 200_000_000_000,
            consistency_window_minutes: 200_000_000_000,
            ..QualityConfig::default()
        });
        let mut lp = CollectionLoop::new(collector(0), sink.clone(), timing()).with_quality(quality);

        assert!(matches!(lp.step().await, TickOutcome::Delivered { envelopes: 1, .. }));
        assert!(matches!(lp.step().await, TickOutcome::Delivered { envelopes: 1, .. }));
        assert_eq!(lp.state(), LoopState::Running);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
