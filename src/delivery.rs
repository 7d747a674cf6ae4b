//! Delivery server: WebSocket consumers of the cadenced stream.
//!
//! Binds a TCP listener and upgrades two paths:
//!
//! - [`STREAM_PATH`]: the first consumer starts a streamer run; while that
//!   run is active any further consumer is closed with [`CLOSE_TRY_AGAIN`].
//! - [`CONTROL_PATH`]: request/reply only. Connects, replaces or drops the
//!   device link through the [`LinkManager`] without holding a stream.
//!
//! Per stream consumer:
//!
//! ```text
//! CadenceStreamer ──Tick──► ConsumerSink ──Outbound──► write_loop ──► WsWriter
//!                                               ▲
//! WsReader ──► request handler ─────────────────┘ (topology / health replies)
//! ```
//!
//! The consumer closing, a read error, or the writer task dying calls
//! [`Session::disconnect`]. The device link disconnecting ends the run, and
//! the consumer is then closed with [`CLOSE_NORMAL`].
//!
//! Requests are JSON text frames tagged by `type`:
//!
//! | request | reply |
//! |---|---|
//! | `{"type":"topology"}` | `{"type":"topology","payload":<value or null>}` |
//! | `{"type":"health"}` | `{"type":"health","payload":<health>,"link":<link status>}` |
//! | `{"type":"connect","source":"tcp://..","topology":{..}}` | `{"type":"connect","ok":true,"source":".."}` |
//! | `{"type":"disconnect"}` | `{"type":"disconnect","ok":true,"was_connected":<bool>}` |
//!
//! `connect` and `disconnect` are served on [`CONTROL_PATH`] only.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use crate::constants::{ACCEPT_RETRY_DELAY, CLOSE_ACK_TIMEOUT, CONTROL_PATH, STREAM_PATH};
use crate::link::{LinkManager, Source};
use crate::streamer::{StreamReport, Tick, TickSink, TickValue};
use crate::ws::{self, Accepted, WsMessage, WsReader, WsWriter, CLOSE_NORMAL, CLOSE_TRY_AGAIN};

/// Per-server delivery options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryOptions {
    /// Send nothing on underrun ticks instead of `null`.
    pub skip_underruns: bool,
}

/// Frames queued for a consumer's writer task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: &'static str },
}

/// Consumer request, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Topology,
    Health,
    Connect {
        source: String,
        #[serde(default)]
        topology: Option<Value>,
    },
    Disconnect,
}

/// WebSocket server feeding one consumer at a time.
#[derive(Debug)]
pub struct DeliveryServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl DeliveryServer {
    /// Bind `addr` and spawn the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(addr: &str, links: Arc<LinkManager>, options: DeliveryOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind delivery server on {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("[Delivery] Listening on ws://{local_addr}{STREAM_PATH} and {CONTROL_PATH}");

        let accept_handle = tokio::spawn(Self::accept_loop(listener, links, options));
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    async fn accept_loop(listener: TcpListener, links: Arc<LinkManager>, options: DeliveryOptions) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let links = Arc::clone(&links);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, links, options).await {
                            log::warn!("[Delivery] Connection {peer} failed: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("[Delivery] Accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting consumers. Connections already open run to completion.
    pub fn shutdown(self) {
        self.accept_handle.abort();
    }
}

/// Streamer sink writing ticks into a consumer's outbound queue.
#[derive(Debug)]
struct ConsumerSink {
    tx: UnboundedSender<Outbound>,
    skip_underruns: bool,
}

#[async_trait]
impl TickSink for ConsumerSink {
    async fn deliver(&mut self, tick: Tick) -> Result<()> {
        if self.skip_underruns && matches!(tick.value, TickValue::Underrun) {
            return Ok(());
        }
        let text = tick.value.to_json().to_string();
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_closed| anyhow::anyhow!("consumer writer closed"))
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    links: Arc<LinkManager>,
    options: DeliveryOptions,
) -> Result<()> {
    let accepted = ws::accept(stream, &[STREAM_PATH, CONTROL_PATH]).await?;
    if accepted.path == CONTROL_PATH {
        serve_control(accepted, peer, &links).await
    } else {
        serve_consumer(accepted, peer, &links, options).await
    }
}

/// Answer control requests until the client leaves.
async fn serve_control(accepted: Accepted, peer: SocketAddr, links: &LinkManager) -> Result<()> {
    let Accepted {
        mut writer,
        mut reader,
        ..
    } = accepted;
    log::info!("[Delivery] Control client {peer} connected");

    while let Some(incoming) = reader.recv().await {
        match incoming? {
            WsMessage::Text(text) => {
                if let Some(reply) = answer_request(&text, links, true).await {
                    writer.send_text(reply.to_string()).await?;
                }
            }
            WsMessage::Close { .. } => break,
            WsMessage::Other => {}
        }
    }

    log::info!("[Delivery] Control client {peer} left");
    let _ = writer.close().await;
    Ok(())
}

async fn serve_consumer(
    accepted: Accepted,
    peer: SocketAddr,
    links: &LinkManager,
    options: DeliveryOptions,
) -> Result<()> {
    let Accepted {
        mut writer, reader, ..
    } = accepted;
    let session = links.session();
    let consumer_id = Uuid::new_v4();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let sink = ConsumerSink {
        tx: out_tx.clone(),
        skip_underruns: options.skip_underruns,
    };

    let run = match session.begin_streaming(sink) {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("[Delivery] Rejecting consumer {peer}: {e}");
            writer
                .send_close(CLOSE_TRY_AGAIN, "another consumer is streaming")
                .await?;
            return Ok(());
        }
    };
    log::info!("[Delivery] Consumer {consumer_id} ({peer}) streaming");

    let mut write_handle = tokio::spawn(write_loop(consumer_id, writer, out_rx));
    let incoming = inbound(reader);
    tokio::pin!(incoming);

    let outcome = supervise(consumer_id, links, run, &mut write_handle, &mut incoming, &out_tx).await;

    match outcome.finished {
        Ok(report) => log::info!(
            "[Delivery] Consumer {consumer_id} done: {} ticks, {} samples, {} underruns",
            report.ticks,
            report.samples,
            report.underruns
        ),
        Err(e) => log::error!("[Delivery] Streamer task for {consumer_id} failed: {e}"),
    }

    if outcome.writer_done {
        return Ok(());
    }

    // Writer may already be gone if the consumer left first.
    let _ = out_tx.send(Outbound::Close {
        code: CLOSE_NORMAL,
        reason: "stream ended",
    });
    drop(out_tx);
    write_handle.await.context("Writer task panicked")?;
    drain_close(&mut incoming).await;
    Ok(())
}

/// Turn a reader into a stream of inbound frames.
fn inbound(reader: WsReader) -> impl Stream<Item = Result<WsMessage>> {
    futures_util::stream::unfold(reader, |mut reader| async move {
        reader.recv().await.map(|message| (message, reader))
    })
}

/// How a consumer's run ended.
#[derive(Debug)]
struct RunOutcome {
    finished: Result<StreamReport, JoinError>,
    /// The writer task already exited and must not be awaited again.
    writer_done: bool,
}

/// Watch a consumer's run, its writer and its inbound frames.
///
/// Whichever side ends first decides: the run ending (device gone) returns
/// directly; the consumer leaving or the writer dying disconnects the
/// session and waits for the run to wind down.
async fn supervise<I>(
    consumer_id: Uuid,
    links: &LinkManager,
    mut run: JoinHandle<StreamReport>,
    write_handle: &mut JoinHandle<()>,
    incoming: &mut I,
    out_tx: &UnboundedSender<Outbound>,
) -> RunOutcome
where
    I: Stream<Item = Result<WsMessage>> + Unpin,
{
    let session = links.session();
    loop {
        tokio::select! {
            joined = &mut run => {
                return RunOutcome { finished: joined, writer_done: false };
            }
            written = &mut *write_handle => {
                if let Err(e) = written {
                    log::error!("[Delivery] Writer for {consumer_id} panicked: {e}");
                }
                log::warn!("[Delivery] Consumer {consumer_id} unreachable, stopping its run");
                session.disconnect();
                return RunOutcome { finished: run.await, writer_done: true };
            }
            incoming = incoming.next() => {
                if !handle_incoming(consumer_id, incoming, links, out_tx).await {
                    session.disconnect();
                    return RunOutcome { finished: run.await, writer_done: false };
                }
            }
        }
    }
}

/// Handle one inbound frame. Returns `false` when the consumer is gone.
async fn handle_incoming(
    consumer_id: Uuid,
    incoming: Option<Result<WsMessage>>,
    links: &LinkManager,
    out_tx: &UnboundedSender<Outbound>,
) -> bool {
    match incoming {
        Some(Ok(WsMessage::Text(text))) => {
            if let Some(reply) = answer_request(&text, links, false).await {
                let _ = out_tx.send(Outbound::Text(reply.to_string()));
            }
            true
        }
        Some(Ok(WsMessage::Close { code, reason })) => {
            log::info!("[Delivery] Consumer {consumer_id} closed ({code} {reason})");
            false
        }
        Some(Ok(WsMessage::Other)) => true,
        Some(Err(e)) => {
            log::warn!("[Delivery] Consumer {consumer_id} read failed: {e:#}");
            false
        }
        None => {
            log::info!("[Delivery] Consumer {consumer_id} went away");
            false
        }
    }
}

/// Reply to a request, or `None` for non-JSON text.
///
/// Device control requests are refused unless `allow_control` is set.
async fn answer_request(text: &str, links: &LinkManager, allow_control: bool) -> Option<Value> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("[Delivery] Ignoring non-JSON request: {e}");
            return None;
        }
    };
    let request = match serde_json::from_value::<Request>(raw) {
        Ok(request) => request,
        Err(e) => return Some(json!({"type": "error", "message": format!("bad request: {e}")})),
    };

    let session = links.session();
    let reply = match request {
        Request::Topology => {
            let payload = session
                .state()
                .topology()
                .map_or(Value::Null, |topology| (*topology).clone());
            json!({"type": "topology", "payload": payload})
        }
        Request::Health => {
            let link = links.status().await;
            json!({"type": "health", "payload": session.health(), "link": link})
        }
        Request::Connect { .. } | Request::Disconnect if !allow_control => json!({
            "type": "error",
            "message": format!("device control is served on {CONTROL_PATH}"),
        }),
        Request::Connect { source, topology } => match connect_device(links, &source, topology).await {
            Ok(source) => json!({"type": "connect", "ok": true, "source": source.to_string()}),
            Err(e) => {
                log::warn!("[Delivery] Connect to {source} failed: {e:#}");
                json!({"type": "connect", "ok": false, "error": format!("{e:#}")})
            }
        },
        Request::Disconnect => {
            let was_connected = links.disconnect().await;
            json!({"type": "disconnect", "ok": true, "was_connected": was_connected})
        }
    };
    Some(reply)
}

async fn connect_device(links: &LinkManager, source: &str, topology: Option<Value>) -> Result<Source> {
    let source: Source = source.parse()?;
    links.connect(source.clone(), topology).await?;
    Ok(source)
}

/// Forward queued frames to the socket until the queue closes, a close
/// frame is sent, or a write fails.
async fn write_loop(consumer_id: Uuid, mut writer: WsWriter, mut out_rx: UnboundedReceiver<Outbound>) {
    while let Some(outbound) = out_rx.recv().await {
        let result = match outbound {
            Outbound::Text(text) => writer.send_text(text).await,
            Outbound::Close { code, reason } => {
                if let Err(e) = writer.send_close(code, reason).await {
                    log::debug!("[Delivery] Close to {consumer_id} not sent: {e:#}");
                }
                break;
            }
        };
        if let Err(e) = result {
            log::warn!("[Delivery] Write to {consumer_id} failed: {e:#}");
            break;
        }
    }
    let _ = writer.close().await;
}

/// Read until the peer acknowledges our close or the stream ends.
async fn drain_close<I>(incoming: &mut I)
where
    I: Stream<Item = Result<WsMessage>> + Unpin,
{
    let drained = tokio::time::timeout(CLOSE_ACK_TIMEOUT, async {
        while let Some(Ok(message)) = incoming.next().await {
            if matches!(message, WsMessage::Close { .. }) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        log::debug!("[Delivery] Consumer did not acknowledge close");
    }
}
