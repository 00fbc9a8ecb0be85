//! WebSocket transport seam
//!
//! The connection manager owns a boxed [`Transport`] and reuses it for every
//! connection it opens. [`WsTransport`] is the tokio-tungstenite
//! implementation; tests plug in the in-memory transport from `testing`.
//!
//! ```no_run
//! use kucoin_ws::transport::{Transport, TransportError, WsTransport};
//!
//! async fn example() -> Result<(), TransportError> {
//!     let mut transport = WsTransport::new();
//!     transport.connect("wss://ws-api-spot.kucoin.com/?token=...&connectId=1").await?;
//!     transport.send(r#"{"id":"1","type":"ping"}"#).await?;
//!     while let Some(frame) = transport.recv().await? {
//!         println!("{}", frame);
//!     }
//!     println!("closed: {:?}", transport.close_reason());
//!     Ok(())
//! }
//! ```

use crate::endpoint::redact;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use kucoin_types::StreamError;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport layer errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the upgrade
    #[error("cannot reach {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// An open or send did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The stream ended without a close frame
    #[error("connection dropped without a close frame")]
    Dropped,

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    /// A frame could not be turned into text
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("not connected")]
    NotConnected,
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        StreamError::Transport(err.to_string())
    }
}

/// One WebSocket connection at a time
///
/// `connect` replaces any previous connection, so a single value serves
/// every reconnect of a socket manager.
#[async_trait]
pub trait Transport: Send {
    /// Open a connection to `url`, closing any existing one first
    async fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    /// Send a text frame
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Next text frame, or `None` once the server sent a close frame
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// tokio-tungstenite transport
pub struct WsTransport {
    socket: Option<Socket>,
    io_timeout: Duration,
    close_reason: Option<String>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            socket: None,
            io_timeout: Duration::from_secs(10),
            close_reason: None,
        }
    }

    /// Limit for opening the socket and for each send
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Code and reason of the last close frame received from the server
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    fn socket(&mut self) -> Result<&mut Socket, TransportError> {
        self.socket.as_mut().ok_or(TransportError::NotConnected)
    }

    fn closed_by_peer(&mut self, frame: Option<CloseFrame<'_>>) {
        let reason = match frame {
            Some(frame) => format!("{} {}", u16::from(frame.code), frame.reason),
            None => "no close frame payload".to_string(),
        };
        info!("Server closed the socket: {}", reason);
        self.close_reason = Some(reason);
        self.socket = None;
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(skip(self, url), fields(url = %redact(url)))]
    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        if self.socket.is_some() {
            let _ = self.close().await;
        }
        self.close_reason = None;

        let after = self.io_timeout;
        let (socket, response) = timeout(after, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                after,
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: redact(url),
                reason: e.to_string(),
            })?;

        debug!("WebSocket upgraded with status {}", response.status());
        self.socket = Some(socket);
        Ok(())
    }

    #[instrument(skip(self, message), fields(len = message.len()))]
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let after = self.io_timeout;
        let socket = self.socket()?;

        match timeout(after, socket.send(Message::Text(message.to_string()))).await {
            Ok(result) => result.map_err(|e| TransportError::Send(e.to_string())),
            Err(_) => Err(TransportError::Timeout {
                operation: "send",
                after,
            }),
        }
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let next = self.socket()?.next().await;

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| TransportError::InvalidFrame(e.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed_by_peer(frame);
                    return Ok(None);
                }
                // WebSocket-level pings are answered by tungstenite
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(TransportError::Receive(e.to_string()));
                }
                None => {
                    self.socket = None;
                    return Err(TransportError::Dropped);
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };

        match socket.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                debug!("Socket was already closed");
                Ok(())
            }
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}
