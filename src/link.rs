//! Device link: the byte source feeding the ingest channel.
//!
//! The relay does not discover or pair with devices itself. Any byte stream
//! that carries the device's notification payloads will do:
//!
//! - `tcp://host:port` (or bare `host:port`), e.g. a BLE-UART bridge.
//!   The handshake payload is written to the device as one JSON line
//!   before reading starts.
//! - `-` for standard input, for piping captures. No handshake is written.
//!
//! [`LinkManager`] owns the current link. Connecting again tears the old
//! link down first, so each link gets its own ingest task and decoder and
//! no partial line survives a reconnect. When a link's stream ends or fails
//! the session is disconnected.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::constants::{DEVICE_CONNECT_TIMEOUT, LINK_READ_CHUNK};
use crate::ingest::{chunk_channel, ChunkSender};
use crate::session::Session;

/// Where device bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// TCP connection to `host:port`.
    Tcp(String),
    /// Process standard input.
    Stdin,
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "-" {
            return Ok(Self::Stdin);
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        if addr.is_empty() || !addr.contains(':') {
            bail!("invalid source {s:?}: expected tcp://host:port, host:port or -");
        }
        Ok(Self::Tcp(addr.to_string()))
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Stdin => write!(f, "stdin"),
        }
    }
}

/// Readable side of an opened device link.
type DeviceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Connect to `source` and perform the handshake.
///
/// The topology is stored in the session only once the handshake has been
/// written.
pub async fn open(source: &Source, session: &Session, topology: Option<Value>) -> Result<DeviceReader> {
    match source {
        Source::Tcp(addr) => {
            let connect = async {
                let mut stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("Failed to connect to device at {addr}"))?;
                log::info!("[Link] Connected to {source}");

                if let Some(topology) = &topology {
                    let mut handshake = serde_json::to_vec(topology)?;
                    handshake.push(b'\n');
                    stream
                        .write_all(&handshake)
                        .await
                        .context("Failed to send handshake")?;
                    log::info!("[Link] Handshake sent ({} bytes)", handshake.len());
                }
                anyhow::Ok(stream)
            };
            let stream = tokio::time::timeout(DEVICE_CONNECT_TIMEOUT, connect)
                .await
                .with_context(|| format!("Timed out connecting to {source}"))??;

            if let Some(topology) = topology {
                session.connect(topology);
            }
            Ok(Box::new(stream))
        }
        Source::Stdin => {
            log::info!("[Link] Reading device bytes from stdin");
            if let Some(topology) = topology {
                session.connect(topology);
            }
            Ok(Box::new(tokio::io::stdin()))
        }
    }
}

/// Forward reads from `reader` as chunks until EOF or the channel closes.
pub async fn pump<R>(mut reader: R, chunk_tx: &ChunkSender) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; LINK_READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.context("Device read failed")?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if chunk_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
            log::warn!("[Link] Ingest channel closed, stopping reader");
            return Ok(total);
        }
    }
}

/// Pump an opened link, then disconnect the session however it ended.
async fn pump_until_closed(
    source: Source,
    reader: DeviceReader,
    session: Arc<Session>,
    chunk_tx: ChunkSender,
) -> Result<u64> {
    let result = pump(reader, &chunk_tx).await;

    session.disconnect();
    match &result {
        Ok(bytes) => log::info!("[Link] {source} closed after {bytes} bytes"),
        Err(e) => log::error!("[Link] {source} failed: {e:#}"),
    }
    result
}

#[derive(Debug)]
struct ActiveLink {
    source: Source,
    pump: JoinHandle<Result<u64>>,
}

/// Snapshot of the managed link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// Display form of the current or last source.
    pub source: Option<String>,
    /// Whether the link is still reading.
    pub connected: bool,
}

/// Owner of the session's device link.
///
/// At most one link is active. [`LinkManager::connect`] replaces it and
/// [`LinkManager::disconnect`] drops it; both disconnect the session, which
/// ends any delivery run.
#[derive(Debug)]
pub struct LinkManager {
    session: Arc<Session>,
    active: Mutex<Option<ActiveLink>>,
}

impl LinkManager {
    /// Manage links for `session`.
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            active: Mutex::new(None),
        }
    }

    /// The session links feed.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Replace the current link with a fresh one to `source`.
    ///
    /// Any existing link is dropped and the session disconnected before the
    /// new handshake. On success the link is read on its own task with a
    /// new ingest pipeline.
    pub async fn connect(&self, source: Source, topology: Option<Value>) -> Result<()> {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(previous) => self.drop_link(previous),
            None => self.session.disconnect(),
        }

        let reader = open(&source, &self.session, topology).await?;

        let (chunk_tx, chunk_rx) = chunk_channel();
        // Ends on its own once the pump's sender is dropped.
        let _ingest = self.session.ingest().spawn(chunk_rx);
        let pump = tokio::spawn(pump_until_closed(
            source.clone(),
            reader,
            Arc::clone(&self.session),
            chunk_tx,
        ));
        *active = Some(ActiveLink { source, pump });
        Ok(())
    }

    /// Drop the current link. Returns whether a live link was dropped.
    pub async fn disconnect(&self) -> bool {
        let previous = self.active.lock().await.take();
        let was_live = previous.as_ref().is_some_and(|link| !link.pump.is_finished());
        match previous {
            Some(link) => self.drop_link(link),
            None => self.session.disconnect(),
        }
        was_live
    }

    /// Current link state.
    pub async fn status(&self) -> LinkStatus {
        let active = self.active.lock().await;
        LinkStatus {
            source: active.as_ref().map(|link| link.source.to_string()),
            connected: active.as_ref().is_some_and(|link| !link.pump.is_finished()),
        }
    }

    fn drop_link(&self, link: ActiveLink) {
        if !link.pump.is_finished() {
            log::info!("[Link] Dropping {}", link.source);
        }
        link.pump.abort();
        self.session.disconnect();
    }
}
