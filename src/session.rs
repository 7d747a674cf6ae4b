//! Relay session: the owned context shared by the producer and consumer
//! sides.
//!
//! A [`Session`] bundles everything one device connection needs:
//!
//! - [`SessionState`] - last handshake payload and the streaming flag
//! - [`RelayBuffer`] - samples between ingest and delivery
//! - [`CadenceStreamer`] - the fixed-rate delivery loop
//! - [`IngestStats`] - producer-side health counters
//!
//! Collaborators receive an `Arc<Session>`; nothing here is global, so
//! tests can run as many isolated sessions as they like.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::framing::LineDecoder;
use crate::ingest::{Ingest, IngestSnapshot, IngestStats};
use crate::relay_buffer::RelayBuffer;
use crate::streamer::{CadenceStreamer, StreamReport, StreamerError, StreamerState, StreamerStats, TickSink};

/// Handshake payload and streaming flag.
///
/// Written only by the connection lifecycle (connect/disconnect), read by
/// anyone. The payload is published as a whole `Arc`, so readers never see
/// a partially updated value.
#[derive(Debug, Default)]
pub struct SessionState {
    topology: RwLock<Option<Arc<Value>>>,
    streaming: AtomicBool,
}

impl SessionState {
    /// Publish a new handshake payload, replacing the previous one.
    pub fn set_topology(&self, payload: Value) {
        let payload = Arc::new(payload);
        match self.topology.write() {
            Ok(mut guard) => *guard = Some(payload),
            Err(poisoned) => *poisoned.into_inner() = Some(payload),
        }
    }

    /// Latest handshake payload, if any handshake has completed.
    pub fn topology(&self) -> Option<Arc<Value>> {
        match self.topology.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Set the streaming flag.
    pub fn mark_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    /// Whether a delivery run is active.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

/// Serializable health snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// Streaming flag from [`SessionState`].
    pub streaming: bool,
    /// Whether a handshake payload is held.
    pub has_topology: bool,
    /// Streamer lifecycle state.
    pub streamer_state: StreamerState,
    /// Samples currently buffered.
    pub buffer_len: usize,
    /// Buffer capacity.
    pub buffer_capacity: usize,
    /// Samples dropped by buffer overflow.
    pub evicted: u64,
    /// Producer-side counters.
    pub ingest: IngestSnapshot,
    /// Delivery-side counters.
    pub streamer: StreamerStats,
}

/// One device session.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    buffer: Arc<RelayBuffer>,
    streamer: CadenceStreamer,
    ingest_stats: Arc<IngestStats>,
    diagnostic_prefix: String,
    max_line_len: usize,
}

impl Session {
    /// Build a session from configuration.
    ///
    /// The config must have passed [`Config::validate`].
    pub fn new(config: &Config) -> Self {
        let buffer = Arc::new(RelayBuffer::new(config.buffer_capacity));
        let streamer = CadenceStreamer::new(Arc::clone(&buffer), config.tick_interval());
        Self {
            state: SessionState::default(),
            buffer,
            streamer,
            ingest_stats: Arc::new(IngestStats::default()),
            diagnostic_prefix: config.diagnostic_prefix.clone(),
            max_line_len: config.max_line_len,
        }
    }

    /// Handshake and streaming flag.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Shared relay buffer.
    pub fn buffer(&self) -> &Arc<RelayBuffer> {
        &self.buffer
    }

    /// The session's streamer.
    pub fn streamer(&self) -> &CadenceStreamer {
        &self.streamer
    }

    /// Create the producer-side pipeline feeding this session's buffer.
    ///
    /// Each call gets a fresh decoder; use one per device link.
    pub fn ingest(&self) -> Ingest {
        let decoder = LineDecoder::with_diagnostic_prefix(self.diagnostic_prefix.clone())
            .max_line_len(self.max_line_len);
        Ingest::new(decoder, Arc::clone(&self.buffer), Arc::clone(&self.ingest_stats))
    }

    /// Record a completed handshake.
    pub fn connect(&self, topology: Value) {
        log::info!("[Session] Handshake stored");
        self.state.set_topology(topology);
    }

    /// Start a delivery run into `sink`.
    ///
    /// A streamer left `Stopped` by an earlier run is reset first. Fails
    /// with [`StreamerError::AlreadyRunning`] while another run is active.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn begin_streaming<S>(&self, sink: S) -> Result<JoinHandle<StreamReport>, StreamerError>
    where
        S: TickSink + 'static,
    {
        self.streamer.reset()?;
        let handle = self.streamer.start(sink)?;
        self.state.mark_streaming(true);
        Ok(handle)
    }

    /// Stop delivery and clear the streaming flag.
    ///
    /// The handshake payload is kept until the next [`Session::connect`].
    pub fn disconnect(&self) {
        self.streamer.stop();
        if self.state.is_streaming() {
            log::info!("[Session] Disconnected");
        }
        self.state.mark_streaming(false);
    }

    /// Point-in-time health snapshot.
    pub fn health(&self) -> Health {
        Health {
            streaming: self.state.is_streaming(),
            has_topology: self.state.topology().is_some(),
            streamer_state: self.streamer.state(),
            buffer_len: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            evicted: self.buffer.evicted(),
            ingest: self.ingest_stats.snapshot(),
            streamer: self.streamer.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamer::{Tick, TickValue};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_config() -> Config {
        Config {
            buffer_capacity: 4,
            tick_hz: 100,
            ..Config::default()
        }
    }

    #[test]
    fn test_topology_starts_absent() {
        let state = SessionState::default();
        assert!(state.topology().is_none());
        assert!(!state.is_streaming());
    }

    #[test]
    fn test_set_topology_replaces_whole_value() {
        let state = SessionState::default();
        state.set_topology(json!({"channels": 2}));
        let first = state.topology().unwrap();
        state.set_topology(json!({"channels": 8, "rate": 125}));

        // Earlier readers keep the value they read.
        assert_eq!(*first, json!({"channels": 2}));
        assert_eq!(*state.topology().unwrap(), json!({"channels": 8, "rate": 125}));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_payload() {
        let state = Arc::new(SessionState::default());
        state.set_topology(json!({"a": 0, "b": 0}));

        let writer = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                for i in 1..500 {
                    state.set_topology(json!({"a": i, "b": i}));
                }
            })
        };
        for _ in 0..500 {
            let payload = state.topology().unwrap();
            assert_eq!(payload["a"], payload["b"]);
        }
        writer.join().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_streamer_and_keeps_topology() {
        let session = Session::new(&test_config());
        session.connect(json!({"device": "test"}));

        let (tx, mut rx) = mpsc::unbounded_channel::<Tick>();
        let handle = session.begin_streaming(tx).unwrap();
        assert!(session.state().is_streaming());
        assert!(rx.recv().await.is_some());

        session.disconnect();
        let report = handle.await.unwrap();
        assert!(report.ticks >= 1);
        assert!(!session.state().is_streaming());
        assert_eq!(session.streamer().state(), StreamerState::Stopped);
        assert_eq!(*session.state().topology().unwrap(), json!({"device": "test"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_rejected_while_first_active() {
        let session = Session::new(&test_config());
        let (tx, _rx) = mpsc::unbounded_channel::<Tick>();
        let handle = session.begin_streaming(tx).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel::<Tick>();
        assert_eq!(
            session.begin_streaming(tx2).unwrap_err(),
            StreamerError::AlreadyRunning
        );

        session.disconnect();
        handle.await.unwrap();

        // After the run ends a new consumer can start again.
        let (tx3, mut rx3) = mpsc::unbounded_channel::<Tick>();
        let handle = session.begin_streaming(tx3).unwrap();
        assert!(rx3.recv().await.is_some());
        session.disconnect();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_then_immediate_restart_runs_one_loop() {
        let session = Session::new(&test_config());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel::<Tick>();
        let first = session.begin_streaming(tx_a).unwrap();
        assert!(rx_a.recv().await.is_some());

        session.disconnect();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel::<Tick>();
        let second = session.begin_streaming(tx_b).unwrap();
        session.ingest().ingest_chunk(b"a,1\nb,2\n");

        // The first run ends at its next wake-up without delivering again.
        let report = first.await.unwrap();
        assert_eq!(report.ticks, 1);
        assert!(rx_a.try_recv().is_err());

        let mut samples = Vec::new();
        while samples.len() < 2 {
            if let TickValue::Sample(s) = rx_b.recv().await.unwrap().value {
                samples.push(s.values);
            }
        }
        assert_eq!(samples, vec![vec![1.0], vec![2.0]]);
        assert!(session.state().is_streaming());

        session.disconnect();
        second.await.unwrap();
    }

    #[test]
    fn test_health_reflects_buffer() {
        let session = Session::new(&test_config());
        let mut ingest = session.ingest();
        ingest.ingest_chunk(b"a,1\nb,2\nc,3\nd,4\ne,5\nnope\n");

        let health = session.health();
        assert_eq!(health.buffer_capacity, 4);
        assert_eq!(health.buffer_len, 4);
        assert_eq!(health.evicted, 1);
        assert_eq!(health.ingest.accepted, 5);
        assert_eq!(health.ingest.rejected, 1);
        assert!(!health.streaming);
        assert_eq!(health.streamer_state, StreamerState::Idle);
    }
}
