//! Fixed-cadence delivery loop.
//!
//! The [`CadenceStreamer`] pops exactly one sample from the [`RelayBuffer`]
//! per tick and hands it to a [`TickSink`]. When the buffer is empty it
//! emits [`TickValue::Underrun`] instead, so the consumer sees one value per
//! tick no matter how the device bursts.
//!
//! # State machine
//!
//! ```text
//! Idle ──start()──► Running ──stop()──► Stopped ──reset()──► Idle
//! ```
//!
//! # Drift correction
//!
//! Tick deadlines are accumulated from the first deadline
//! (`deadline += interval`), never recomputed from the wake-up time. A tick
//! that runs late is followed by back-to-back ticks until the schedule is
//! caught up, so the long-run rate stays at `1 / interval`.
//!
//! # Run identity
//!
//! Every `start()` belongs to a generation, and `stop()` retires the current
//! generation. A loop keeps ticking only while the state is `Running` and
//! the generation it was started with is still current, so a loop still
//! asleep after `stop()` exits on wake-up even if `reset()` and `start()`
//! already began a new run.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::record::Sample;
use crate::relay_buffer::RelayBuffer;

/// Lifecycle state of a [`CadenceStreamer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StreamerState {
    /// Constructed or reset, not yet started.
    Idle = 0,
    /// Tick loop is active.
    Running = 1,
    /// Stop requested; the loop exits at its next check.
    Stopped = 2,
}

impl StreamerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for StreamerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors from streamer state transitions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerError {
    /// A tick loop is already running for this streamer.
    #[error("streamer is already running")]
    AlreadyRunning,
    /// The streamer was stopped and must be reset before restarting.
    #[error("streamer is stopped; reset it before starting again")]
    Stopped,
}

/// What a tick carries.
#[derive(Debug, Clone, PartialEq)]
pub enum TickValue {
    /// The oldest buffered sample.
    Sample(Sample),
    /// The buffer was empty on this tick.
    Underrun,
}

impl TickValue {
    /// Wire form: the sample object, or `null` for an underrun.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Sample(sample) => {
                serde_json::to_value(sample.wire()).unwrap_or(serde_json::Value::Null)
            }
            Self::Underrun => serde_json::Value::Null,
        }
    }
}

/// One tick of the cadence loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Zero-based tick number within the run.
    pub seq: u64,
    /// Scheduled instant of this tick.
    pub deadline: Instant,
    /// Sample or underrun marker.
    pub value: TickValue,
}

/// Delivery collaborator for the tick loop.
///
/// Called exactly once per tick. Errors are logged and counted by the
/// streamer but never retried; the sink owner is expected to report the
/// failure and stop the streamer.
#[async_trait]
pub trait TickSink: Send {
    /// Deliver one tick.
    async fn deliver(&mut self, tick: Tick) -> anyhow::Result<()>;
}

#[async_trait]
impl TickSink for UnboundedSender<Tick> {
    async fn deliver(&mut self, tick: Tick) -> anyhow::Result<()> {
        self.send(tick)
            .map_err(|_closed| anyhow::anyhow!("tick receiver dropped"))
    }
}

/// Counters for a single run, returned from the run's task handle.
#[derive(Debug, Clone, Copy)]
pub struct StreamReport {
    /// Instant the run was started (first deadline).
    pub started_at: Instant,
    /// Deadline the loop would have used next.
    pub next_deadline: Instant,
    /// Ticks emitted.
    pub ticks: u64,
    /// Ticks that carried a sample.
    pub samples: u64,
    /// Ticks that carried an underrun marker.
    pub underruns: u64,
    /// Ticks that started a full interval or more behind schedule.
    pub late_ticks: u64,
    /// Ticks the sink failed to deliver.
    pub delivery_failures: u64,
}

impl StreamReport {
    fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            next_deadline: started_at,
            ticks: 0,
            samples: 0,
            underruns: 0,
            late_ticks: 0,
            delivery_failures: 0,
        }
    }
}

/// Cumulative counters across all runs of a streamer.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamerStats {
    /// Ticks emitted.
    pub ticks: u64,
    /// Ticks that carried a sample.
    pub samples: u64,
    /// Ticks that carried an underrun marker.
    pub underruns: u64,
    /// Ticks that started a full interval or more behind schedule.
    pub late_ticks: u64,
    /// Ticks the sink failed to deliver.
    pub delivery_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    samples: AtomicU64,
    underruns: AtomicU64,
    late_ticks: AtomicU64,
    delivery_failures: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    generation: AtomicU64,
    interval: Duration,
    buffer: Arc<RelayBuffer>,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> StreamerState {
        StreamerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the run started as `generation` should keep ticking.
    fn owns(&self, generation: u64) -> bool {
        self.state() == StreamerState::Running
            && self.generation.load(Ordering::Acquire) == generation
    }
}

/// Strict-interval consumer of a [`RelayBuffer`].
///
/// Cheap to clone; clones share state, so any clone can stop the loop.
#[derive(Debug, Clone)]
pub struct CadenceStreamer {
    shared: Arc<Shared>,
}

impl CadenceStreamer {
    /// Create an idle streamer popping from `buffer` every `interval`.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    #[must_use]
    pub fn new(buffer: Arc<RelayBuffer>, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "tick interval must be > 0");
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(StreamerState::Idle as u8),
                generation: AtomicU64::new(0),
                interval,
                buffer,
                counters: Counters::default(),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamerState {
        self.shared.state()
    }

    /// Configured tick interval.
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Start the tick loop on the current tokio runtime.
    ///
    /// The first tick is due immediately. Only an `Idle` streamer can start;
    /// a second call never spawns a second loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start<S>(&self, sink: S) -> Result<JoinHandle<StreamReport>, StreamerError>
    where
        S: TickSink + 'static,
    {
        self.shared
            .state
            .compare_exchange(
                StreamerState::Idle as u8,
                StreamerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| match StreamerState::from_u8(current) {
                StreamerState::Stopped => StreamerError::Stopped,
                _ => StreamerError::AlreadyRunning,
            })?;

        let generation = self.shared.generation.load(Ordering::Acquire);
        let started_at = Instant::now();
        log::info!(
            "[Streamer] Run {generation} started at {:.1} Hz",
            1.0 / self.shared.interval.as_secs_f64()
        );
        Ok(tokio::spawn(run(
            Arc::clone(&self.shared),
            sink,
            started_at,
            generation,
        )))
    }

    /// Request the loop to stop. Takes effect within one tick.
    ///
    /// Idempotent: stopping an idle or stopped streamer is a no-op apart
    /// from moving it to `Stopped`. The current run's generation is retired,
    /// so its loop never resumes after a later `reset()`/`start()`.
    pub fn stop(&self) {
        let previous = self
            .shared
            .state
            .swap(StreamerState::Stopped as u8, Ordering::AcqRel);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if StreamerState::from_u8(previous) == StreamerState::Running {
            log::info!("[Streamer] Stop requested");
        }
    }

    /// Return a stopped streamer to `Idle` so it can be started again.
    pub fn reset(&self) -> Result<(), StreamerError> {
        match self.state() {
            StreamerState::Running => Err(StreamerError::AlreadyRunning),
            StreamerState::Idle => Ok(()),
            StreamerState::Stopped => {
                self.shared
                    .state
                    .compare_exchange(
                        StreamerState::Stopped as u8,
                        StreamerState::Idle as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .map(|_| ())
                    .map_err(|_raced| StreamerError::AlreadyRunning)
            }
        }
    }

    /// Cumulative counters across every run.
    pub fn stats(&self) -> StreamerStats {
        let c = &self.shared.counters;
        StreamerStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            samples: c.samples.load(Ordering::Relaxed),
            underruns: c.underruns.load(Ordering::Relaxed),
            late_ticks: c.late_ticks.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Tick loop, run as a tokio task until the state leaves `Running`.
async fn run<S: TickSink>(
    shared: Arc<Shared>,
    mut sink: S,
    started_at: Instant,
    generation: u64,
) -> StreamReport {
    let mut report = StreamReport::new(started_at);
    let mut deadline = started_at;

    while shared.owns(generation) {
        let now = Instant::now();
        if deadline > now {
            tokio::time::sleep_until(deadline).await;
            if !shared.owns(generation) {
                break;
            }
        } else if now.duration_since(deadline) >= shared.interval {
            report.late_ticks += 1;
            shared.counters.late_ticks.fetch_add(1, Ordering::Relaxed);
        }

        let value = match shared.buffer.pop_oldest() {
            Some(sample) => {
                report.samples += 1;
                shared.counters.samples.fetch_add(1, Ordering::Relaxed);
                TickValue::Sample(sample)
            }
            None => {
                report.underruns += 1;
                shared.counters.underruns.fetch_add(1, Ordering::Relaxed);
                TickValue::Underrun
            }
        };

        let tick = Tick {
            seq: report.ticks,
            deadline,
            value,
        };
        if let Err(e) = sink.deliver(tick).await {
            report.delivery_failures += 1;
            shared
                .counters
                .delivery_failures
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("[Streamer] Tick {} not delivered: {e:#}", report.ticks);
        }

        report.ticks += 1;
        shared.counters.ticks.fetch_add(1, Ordering::Relaxed);
        deadline += shared.interval;
        report.next_deadline = deadline;
    }

    log::info!(
        "[Streamer] Run {generation} stopped after {} ticks ({} samples, {} underruns, {} late)",
        report.ticks,
        report.samples,
        report.underruns,
        report.late_ticks
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;

    const TICK: Duration = Duration::from_millis(10);

    fn sample(v: f64) -> Sample {
        Sample {
            captured_at: Utc::now(),
            values: vec![v],
        }
    }

    /// Records ticks and stops the streamer after `limit` of them.
    struct StopAfter {
        streamer: CadenceStreamer,
        limit: u64,
        seen: Vec<(Tick, Instant)>,
        delay_first: Duration,
        tx: mpsc::UnboundedSender<Vec<(Tick, Instant)>>,
    }

    impl StopAfter {
        fn new(
            streamer: &CadenceStreamer,
            limit: u64,
        ) -> (Self, mpsc::UnboundedReceiver<Vec<(Tick, Instant)>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = Self {
                streamer: streamer.clone(),
                limit,
                seen: Vec::new(),
                delay_first: Duration::ZERO,
                tx,
            };
            (sink, rx)
        }
    }

    #[async_trait]
    impl TickSink for StopAfter {
        async fn deliver(&mut self, tick: Tick) -> anyhow::Result<()> {
            if self.seen.is_empty() && !self.delay_first.is_zero() {
                tokio::time::sleep(self.delay_first).await;
            }
            self.seen.push((tick, Instant::now()));
            if self.seen.len() as u64 == self.limit {
                self.streamer.stop();
                let _ = self.tx.send(std::mem::take(&mut self.seen));
            }
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl TickSink for FailingSink {
        async fn deliver(&mut self, _tick: Tick) -> anyhow::Result<()> {
            anyhow::bail!("consumer gone")
        }
    }

    #[test]
    fn test_new_streamer_is_idle() {
        let streamer = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), TICK);
        assert_eq!(streamer.state(), StreamerState::Idle);
        assert_eq!(streamer.interval(), TICK);
    }

    #[test]
    #[should_panic(expected = "tick interval must be > 0")]
    fn test_zero_interval_panics() {
        let _ = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_underruns_and_drift_free_target() {
        let streamer = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), TICK);
        let (sink, mut rx) = StopAfter::new(&streamer, 5);

        let handle = streamer.start(sink).unwrap();
        let report = handle.await.unwrap();
        let ticks = rx.recv().await.unwrap();

        assert_eq!(ticks.len(), 5);
        assert!(ticks.iter().all(|(t, _)| t.value == TickValue::Underrun));
        assert_eq!(report.underruns, 5);
        assert_eq!(report.samples, 0);
        for (i, (tick, _)) in ticks.iter().enumerate() {
            assert_eq!(tick.seq, i as u64);
            assert_eq!(tick.deadline, report.started_at + TICK * i as u32);
        }
        assert_eq!(
            report.next_deadline.duration_since(report.started_at),
            Duration::from_millis(50)
        );
        assert_eq!(streamer.state(), StreamerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_popped_in_fifo_order_then_underrun() {
        let buffer = Arc::new(RelayBuffer::new(8));
        buffer.push(sample(1.0));
        buffer.push(sample(2.0));
        let streamer = CadenceStreamer::new(Arc::clone(&buffer), TICK);
        let (sink, mut rx) = StopAfter::new(&streamer, 3);

        let report = streamer.start(sink).unwrap().await.unwrap();
        let ticks = rx.recv().await.unwrap();

        let values: Vec<_> = ticks.into_iter().map(|(t, _)| t.value).collect();
        assert!(matches!(&values[0], TickValue::Sample(s) if s.values == vec![1.0]));
        assert!(matches!(&values[1], TickValue::Sample(s) if s.values == vec![2.0]));
        assert_eq!(values[2], TickValue::Underrun);
        assert_eq!(report.samples, 2);
        assert_eq!(report.underruns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tick_does_not_shift_schedule() {
        let streamer = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), TICK);
        let (mut sink, mut rx) = StopAfter::new(&streamer, 6);
        // First delivery overruns by 2.5 ticks.
        sink.delay_first = Duration::from_millis(25);

        let report = streamer.start(sink).unwrap().await.unwrap();
        let ticks = rx.recv().await.unwrap();
        let origin = report.started_at;

        // Deadlines stay on the start-anchored grid.
        for (i, (tick, _)) in ticks.iter().enumerate() {
            assert_eq!(tick.deadline, origin + TICK * i as u32);
        }
        // Ticks 1 and 2 were already due when tick 0 finished, so they fire
        // back to back; tick 3 is back on schedule.
        assert_eq!(ticks[1].1, origin + Duration::from_millis(25));
        assert_eq!(ticks[2].1, origin + Duration::from_millis(25));
        assert_eq!(ticks[3].1, origin + Duration::from_millis(30));
        assert_eq!(ticks[5].1, origin + Duration::from_millis(50));
        assert_eq!(report.late_ticks, 1);
        assert_eq!(report.next_deadline, origin + TICK * 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_rejected() {
        let streamer = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), TICK);
        let (tx, mut rx) = mpsc::unbounded_channel::<Tick>();
        let handle = streamer.start(tx).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel::<Tick>();
        assert_eq!(streamer.start(tx2).unwrap_err(), StreamerError::AlreadyRunning);
        assert_eq!(streamer.reset(), Err(StreamerError::AlreadyRunning));

        assert!(rx.recv().await.is_some());
        streamer.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_restart_needs_reset() {
        let streamer = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), TICK);
        let (tx, _rx) = mpsc::unbounded_channel::<Tick>();
        let handle = streamer.start(tx).unwrap();
        streamer.stop();
        handle.await.unwrap();

        streamer.stop();
        streamer.stop();
        assert_eq!(streamer.state(), StreamerState::Stopped);

        let (tx, _rx) = mpsc::unbounded_channel::<Tick>();
        assert_eq!(streamer.start(tx).unwrap_err(), StreamerError::Stopped);

        streamer.reset().unwrap();
        assert_eq!(streamer.state(), StreamerState::Idle);
        let (tx, mut rx) = mpsc::unbounded_channel::<Tick>();
        let handle = streamer.start(tx).unwrap();
        assert_eq!(rx.recv().await.map(|t| t.seq), Some(0));
        streamer.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_restart_leaves_a_single_loop() {
        let buffer = Arc::new(RelayBuffer::new(16));
        let streamer = CadenceStreamer::new(Arc::clone(&buffer), TICK);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel::<Tick>();
        let first = streamer.start(tx_a).unwrap();
        assert!(rx_a.recv().await.is_some());

        // Old loop is asleep until its next deadline.
        streamer.stop();
        streamer.reset().unwrap();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel::<Tick>();
        let second = streamer.start(tx_b).unwrap();

        for v in 1..=3 {
            buffer.push(sample(f64::from(v)));
        }
        tokio::time::sleep(Duration::from_millis(55)).await;

        let first_report = first.await.unwrap();
        assert_eq!(first_report.ticks, 1);
        assert!(rx_a.try_recv().is_err());

        let mut delivered = Vec::new();
        while let Ok(tick) = rx_b.try_recv() {
            if let TickValue::Sample(s) = tick.value {
                delivered.extend(s.values);
            }
        }
        assert_eq!(delivered, vec![1.0, 2.0, 3.0]);
        assert_eq!(streamer.state(), StreamerState::Running);

        streamer.stop();
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failures_do_not_stop_the_loop() {
        let streamer = CadenceStreamer::new(Arc::new(RelayBuffer::new(4)), TICK);
        let handle = streamer.start(FailingSink).unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        streamer.stop();
        let report = handle.await.unwrap();

        assert!(report.ticks >= 4, "ticks = {}", report.ticks);
        assert_eq!(report.delivery_failures, report.ticks);
        assert_eq!(streamer.stats().delivery_failures, report.ticks);
    }

    #[test]
    fn test_tick_value_json() {
        assert_eq!(TickValue::Underrun.to_json(), serde_json::Value::Null);
        let value = TickValue::Sample(sample(3.5)).to_json();
        assert_eq!(value["raw"], serde_json::json!([3.5]));
        assert!(value["t"].is_f64());
    }
}
