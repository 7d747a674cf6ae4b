//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves for the server side of a consumer connection.
//! Delivery code should use this module rather than `tokio-tungstenite`
//! directly.
//!
//! [`accept`] performs the server handshake, rejecting any request path
//! not in the served set with `404`, and returns the matched path with a
//! ([`WsWriter`], [`WsReader`]) pair ready for `tokio::select!` loops.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Concrete WebSocket stream type for accepted connections.
type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Server is busy, client may retry later.
pub const CLOSE_TRY_AGAIN: u16 = 1013;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary, ping or pong frame. Pings are answered by tungstenite.
    Other,
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a close frame with `code` and `reason`.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .context("WebSocket send_close failed")
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(
                    tungstenite::Message::Binary(_)
                    | tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_),
                )) => {
                    return Some(Ok(WsMessage::Other));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames are never surfaced
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// An upgraded connection and the path it was requested on.
#[derive(Debug)]
pub struct Accepted {
    /// Request path, one of the served paths.
    pub path: &'static str,
    /// Write half.
    pub writer: WsWriter,
    /// Read half.
    pub reader: WsReader,
}

/// Perform the server-side handshake on an accepted TCP stream.
///
/// Requests for any path not in `paths` are answered with `404` and
/// reported as an error.
///
/// # Errors
///
/// Returns an error if the path does not match or the handshake fails.
pub async fn accept(stream: TcpStream, paths: &[&'static str]) -> Result<Accepted> {
    let mut matched = None;
    let check_path = |request: &Request, response: Response| {
        let requested = request.uri().path();
        if let Some(path) = paths.iter().find(|path| **path == requested) {
            matched = Some(*path);
            Ok(response)
        } else {
            let mut not_found = ErrorResponse::new(Some(format!("nothing served at {requested}")));
            *not_found.status_mut() = tungstenite::http::StatusCode::NOT_FOUND;
            Err(not_found)
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .context("WebSocket handshake failed")?;
    let path = matched.context("WebSocket handshake completed without a path")?;

    let (sink, stream) = ws_stream.split();

    Ok(Accepted {
        path,
        writer: WsWriter { sink },
        reader: WsReader { stream },
    })
}
