//! Producer side of the relay: raw chunks in, samples into the buffer.
//!
//! The device link never calls into the decoder directly. It sends each
//! notification payload down an unbounded channel and returns, so a burst
//! never stalls the transport:
//!
//! ```text
//! Device link ──Bytes──► mpsc ──► ingest task ──► LineDecoder ──► parse ──► RelayBuffer
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::framing::LineDecoder;
use crate::record;
use crate::relay_buffer::RelayBuffer;

/// Sender half of the chunk channel.
pub type ChunkSender = UnboundedSender<Bytes>;

/// Receiver half of the chunk channel.
pub type ChunkReceiver = UnboundedReceiver<Bytes>;

/// Create the message-passing boundary between a device link and ingest.
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Producer-side counters, shared with the session for health reporting.
#[derive(Debug, Default)]
pub struct IngestStats {
    chunks: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
    overlong: AtomicU64,
}

/// Plain copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    /// Chunks received.
    pub chunks: u64,
    /// Records parsed into samples.
    pub accepted: u64,
    /// Records rejected by the parser.
    pub rejected: u64,
    /// Blank and diagnostic lines dropped by the decoder.
    pub discarded: u64,
    /// Overlong unterminated fragments dropped by the decoder.
    pub overlong: u64,
}

impl IngestStats {
    /// Read all counters.
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            chunks: self.chunks.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            overlong: self.overlong.load(Ordering::Relaxed),
        }
    }
}

/// Decoder + parser + buffer push for one device link.
#[derive(Debug)]
pub struct Ingest {
    decoder: LineDecoder,
    buffer: Arc<RelayBuffer>,
    stats: Arc<IngestStats>,
    /// Decoder counters already folded into `stats`.
    seen_discarded: u64,
    seen_overlong: u64,
}

impl Ingest {
    /// Wire a decoder to a buffer.
    pub fn new(decoder: LineDecoder, buffer: Arc<RelayBuffer>, stats: Arc<IngestStats>) -> Self {
        Self {
            decoder,
            buffer,
            stats,
            seen_discarded: 0,
            seen_overlong: 0,
        }
    }

    /// Decode `chunk`, parse every completed record and push the samples.
    ///
    /// Returns the number of samples pushed. Never fails: rejected records
    /// are counted and dropped.
    pub fn ingest_chunk(&mut self, chunk: &[u8]) -> usize {
        self.stats.chunks.fetch_add(1, Ordering::Relaxed);
        let mut pushed = 0;

        for line in self.decoder.feed(chunk) {
            match record::parse(&line) {
                Ok(sample) => {
                    self.buffer.push(sample);
                    pushed += 1;
                }
                Err(rejection) => {
                    log::trace!("[Ingest] Dropped record {line:?}: {rejection}");
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats
            .accepted
            .fetch_add(pushed as u64, Ordering::Relaxed);
        self.sync_decoder_counters();
        pushed
    }

    /// Forget any partial line, e.g. after the link reconnects.
    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    fn sync_decoder_counters(&mut self) {
        let discarded = self.decoder.discarded();
        let overlong = self.decoder.overlong();
        self.stats
            .discarded
            .fetch_add(discarded - self.seen_discarded, Ordering::Relaxed);
        self.stats
            .overlong
            .fetch_add(overlong - self.seen_overlong, Ordering::Relaxed);
        self.seen_discarded = discarded;
        self.seen_overlong = overlong;
    }

    /// Consume chunks until every sender is dropped.
    pub async fn run(mut self, mut chunk_rx: ChunkReceiver) {
        log::info!("[Ingest] Started");
        while let Some(chunk) = chunk_rx.recv().await {
            self.ingest_chunk(&chunk);
        }
        if self.decoder.has_partial() {
            log::debug!(
                "[Ingest] Discarding {} byte unterminated tail",
                self.decoder.partial_len()
            );
        }
        log::info!("[Ingest] Chunk channel closed, stopping");
    }

    /// Spawn [`Ingest::run`] as a tokio task.
    pub fn spawn(self, chunk_rx: ChunkReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(chunk_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(capacity: usize) -> (Ingest, Arc<RelayBuffer>, Arc<IngestStats>) {
        let buffer = Arc::new(RelayBuffer::new(capacity));
        let stats = Arc::new(IngestStats::default());
        let ingest = Ingest::new(LineDecoder::new(), Arc::clone(&buffer), Arc::clone(&stats));
        (ingest, buffer, stats)
    }

    fn drain(buffer: &RelayBuffer) -> Vec<Vec<f64>> {
        std::iter::from_fn(|| buffer.pop_oldest())
            .map(|s| s.values)
            .collect()
    }

    #[test]
    fn test_end_to_end_chunks_with_carry_over() {
        let (mut ingest, buffer, stats) = ingest(16);

        assert_eq!(ingest.ingest_chunk(b"12,00:00:01,"), 0);
        assert_eq!(ingest.ingest_chunk(b"foo,1.5,2.25\n[debug]\n3,x,4.0,5\n"), 2);

        assert_eq!(drain(&buffer), vec![vec![12.0, 1.5, 2.25], vec![3.0, 4.0, 5.0]]);
        let snap = stats.snapshot();
        assert_eq!(snap.chunks, 2);
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.rejected, 0);
        assert_eq!(snap.discarded, 1);
    }

    #[test]
    fn test_rejections_are_counted_not_fatal() {
        let (mut ingest, buffer, stats) = ingest(16);
        let pushed = ingest.ingest_chunk(b"only\nms,time,label\n1,2\n");
        assert_eq!(pushed, 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(stats.snapshot().rejected, 2);
    }

    #[test]
    fn test_counters_accumulate_across_chunks() {
        let (mut ingest, _buffer, stats) = ingest(16);
        ingest.ingest_chunk(b"[a]\n");
        ingest.ingest_chunk(b"[b]\n\n");
        assert_eq!(stats.snapshot().discarded, 3);
    }

    #[test]
    fn test_reset_drops_partial_line() {
        let (mut ingest, buffer, _stats) = ingest(16);
        ingest.ingest_chunk(b"99,");
        ingest.reset();
        ingest.ingest_chunk(b"x,1\n");
        assert_eq!(drain(&buffer), vec![vec![1.0]]);
    }

    #[tokio::test]
    async fn test_spawned_task_drains_channel() {
        let (ingest, buffer, stats) = ingest(16);
        let (tx, rx) = chunk_channel();
        let handle = ingest.spawn(rx);

        tx.send(Bytes::from_static(b"a,1\nb,")).unwrap();
        tx.send(Bytes::from_static(b"2\n")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(drain(&buffer), vec![vec![1.0], vec![2.0]]);
        assert_eq!(stats.snapshot().chunks, 2);
    }
}
