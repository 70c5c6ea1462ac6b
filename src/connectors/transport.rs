//! Socket seam for stream connections.
//!
//! [`Connector`] opens a link and hands back its two halves. The production
//! implementation speaks WebSocket through `tokio-tungstenite`; tests plug in
//! in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::utils::LogThrottle;

/// Ping/pong frames are logged at most once per this interval.
const KEEPALIVE_LOG_INTERVAL: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection closed{}", .0.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Closed(Option<String>),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Undecodable frame: {0}")]
    Decode(String),
}

impl TransportError {
    /// The peer went away, cleanly or not. A new link may fix it.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed(_) | TransportError::Reset(_))
    }

    /// Worth another connect attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Refused(_))
    }
}

/// Write half of a link.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a link.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text payload. Control frames are handled internally.
    async fn next_text(&mut self) -> Result<String, TransportError>;
}

/// Opens links to a venue.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

/// Shared cap on simultaneously open links.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl ConnectionLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Semaphore::MAX_PERMITS)
    }

    /// Takes a slot if one is free. The slot is released when the permit drops.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn open_connections(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let (stream, response) = connect_async(url).await.map_err(handshake_error)?;
        info!("WebSocket handshake with {} completed ({})", url, response.status());

        let (sink, source) = stream.split();
        Ok((
            Box::new(WsSink { sink }),
            Box::new(WsSource {
                source,
                keepalive_log: LogThrottle::new(KEEPALIVE_LOG_INTERVAL),
            }),
        ))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink.send(Message::Text(text)).await.map_err(stream_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(stream_error)
    }
}

struct WsSource {
    source: SplitStream<WsStream>,
    keepalive_log: LogThrottle,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_text(&mut self) -> Result<String, TransportError> {
        loop {
            let message = match self.source.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(stream_error(e)),
                None => return Err(TransportError::Closed(None)),
            };

            match message {
                Message::Text(text) => return Ok(text),
                Message::Binary(data) => return decode_binary(data),
                Message::Ping(_) | Message::Pong(_) => {
                    if self.keepalive_log.ready() {
                        debug!(
                            "Keepalive frame received ({} suppressed)",
                            self.keepalive_log.take_suppressed()
                        );
                    }
                }
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    return Err(TransportError::Closed(reason));
                }
                Message::Frame(_) => {}
            }
        }
    }
}

/// Binary payloads carry the same JSON as text frames.
fn decode_binary(data: Vec<u8>) -> Result<String, TransportError> {
    String::from_utf8(data)
        .map_err(|e| TransportError::Decode(format!("binary frame is not UTF-8: {}", e)))
}

fn handshake_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(e.to_string())
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

fn stream_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed(None)
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::Reset(error.to_string())
        }
        tungstenite::Error::Io(e) => TransportError::Reset(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}
