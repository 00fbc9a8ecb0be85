//! Connection lifecycle: token fetch, handshake, heartbeat and reconnection
//!
//! One [`ConnectionManager`] runs as a background task per socket manager.
//! It owns the transport exclusively and is the only code that reads from
//! or writes to it. Callers talk to it through a command queue and observe
//! it through a state watch and the event channel.

use crate::endpoint::{self, redact};
use crate::events::{ConnectionEvent, DisconnectReason, Event};
use crate::reconnect::{NextStep, ReconnectConfig, ReconnectTracker};
use crate::router::{MessageRouter, Routed};
use crate::subscription::{RequestKind, SubscriptionRegistry};
use crate::transport::Transport;

use kucoin_auth::TokenProvider;
use kucoin_types::{
    FrameType, InboundFrame, InstanceServer, PingRequest, StreamError, StreamResult,
    SubscribeRequest, UnsubscribeRequest,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lower bound for the ping period, guards against a zero interval hint
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// WebSocket connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet
    Disconnected,
    /// Fetching a token, opening the socket or waiting for the welcome frame
    Connecting,
    /// Welcome received, subscriptions flowing
    Connected,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
    /// Closed for good
    Closed,
}

/// Configuration for a socket manager
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Request a private (authenticated) connection token
    pub private: bool,
    /// Reconnection settings
    pub reconnect: ReconnectConfig,
    /// Overall budget for `create`/`connect` to reach `Connected`
    pub connect_timeout: Duration,
    /// Time allowed between opening the socket and the welcome frame
    pub handshake_timeout: Duration,
    /// Time allowed for opening or closing the transport
    pub transport_timeout: Duration,
    /// Consecutive unanswered pings before the connection is declared dead
    pub max_missed_pongs: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            private: false,
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            transport_timeout: Duration::from_secs(10),
            max_missed_pongs: 1,
        }
    }
}

impl StreamConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a private connection
    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Set reconnection config
    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Disable automatic reconnection
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = ReconnectConfig::disabled();
        self
    }

    /// Set the overall connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the welcome frame timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the transport open/close timeout
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    /// Set how many pongs may be missed in a row
    pub fn with_max_missed_pongs(mut self, max: u32) -> Self {
        self.max_missed_pongs = max.max(1);
        self
    }
}

/// Requests from the caller-facing API to the background loop
#[derive(Debug)]
pub(crate) enum Command {
    /// A topic was registered
    Subscribe { topic: String },
    /// A topic was removed from the registry
    Unsubscribe { topic: String, private: bool },
}

/// State shared between the facade and the background loop
pub(crate) struct Shared {
    pub registry: Arc<RwLock<SubscriptionRegistry>>,
    pub state: watch::Sender<ConnectionState>,
    pub events: mpsc::UnboundedSender<Event>,
    pub terminal: Mutex<Option<StreamError>>,
}

impl Shared {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            registry: Arc::new(RwLock::new(SubscriptionRegistry::new())),
            state,
            events,
            terminal: Mutex::new(None),
        }
    }

    /// Move to `next` unless already closed
    pub fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            debug!("Connection state {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    pub fn emit(&self, event: impl Into<Event>) {
        let _ = self.events.send(event.into());
    }

    /// Enter `Closed` and release every subscription
    ///
    /// Pending acknowledgement waits resolve with `false` and channel
    /// subscriptions end. Emits `Closed` only on the first call.
    pub fn shut_down(&self) {
        let dropped = self.registry.write().clear();
        if dropped > 0 {
            debug!("Released {} subscription(s)", dropped);
        }

        let was_closed = *self.state.borrow() == ConnectionState::Closed;
        if !was_closed {
            self.set_state(ConnectionState::Closed);
            self.emit(ConnectionEvent::Closed);
        }
    }
}

/// Drives one physical connection at a time, forever replacing it on failure
pub(crate) struct ConnectionManager {
    provider: Arc<dyn TokenProvider>,
    transport: Box<dyn Transport>,
    config: StreamConfig,
    shared: Arc<Shared>,
    router: MessageRouter,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    /// Incremented on every successful handshake
    generation: u64,
    retries: ReconnectTracker,
    request_seq: u64,
}

impl ConnectionManager {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        transport: Box<dyn Transport>,
        config: StreamConfig,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let router = MessageRouter::new(shared.registry.clone(), shared.events.clone());
        let retries = ReconnectTracker::new(config.reconnect.clone());
        Self {
            provider,
            transport,
            config,
            shared,
            router,
            commands,
            shutdown,
            generation: 0,
            retries,
            request_seq: 0,
        }
    }

    /// Run until shutdown or a terminal error
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();

        loop {
            self.shared.set_state(ConnectionState::Connecting);

            let error = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                error = self.session() => error,
            };

            self.close_transport().await;

            let (attempt, delay) = match self.retries.failed(&error) {
                NextStep::Retry { attempt, delay } => (attempt, delay),
                NextStep::GiveUp(terminal) => {
                    self.fail(terminal);
                    return;
                }
            };

            warn!(
                "Connection failed, reconnecting in {:?} (attempt {}): {}",
                delay, attempt, error
            );
            self.shared.set_state(ConnectionState::Reconnecting);
            self.shared.emit(ConnectionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = sleep(delay) => {}
            }
        }

        info!("Shutdown requested, closing connection");
        let was_connected = *self.shared.state.borrow() == ConnectionState::Connected;
        if was_connected {
            self.shared.emit(ConnectionEvent::Disconnected {
                reason: DisconnectReason::Shutdown,
            });
        }
        self.close_transport().await;
        self.shared.shut_down();
    }

    /// One connection attempt, from token fetch until the connection is lost
    async fn session(&mut self) -> StreamError {
        let token = match self.provider.get_token(self.config.private).await {
            Ok(token) => {
                self.retries.token_fetched();
                token
            }
            Err(e) => {
                let streak = self.retries.token_failed();
                warn!("Token fetch failed ({} in a row): {}", streak, e);
                return e.into();
            }
        };

        let endpoint_index = self.retries.endpoint_index();
        let (server, url) = match endpoint::select(&token, endpoint_index, self.config.private) {
            Ok(selected) => selected,
            Err(e) => return e,
        };

        info!("Connecting to {}", redact(&url));
        match timeout(self.config.transport_timeout, self.transport.connect(&url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e.into(),
            Err(_) => {
                return StreamError::Transport(format!(
                    "connect timed out after {:?}",
                    self.config.transport_timeout
                ))
            }
        }

        let handshake = timeout(
            self.config.handshake_timeout,
            self.await_welcome(&token.connect_id),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e,
            Err(_) => {
                return StreamError::Transport(format!(
                    "no welcome frame within {:?}",
                    self.config.handshake_timeout
                ))
            }
        }

        if let Err(e) = self.on_connected(&token.connect_id, &server).await {
            return self.lost(e);
        }

        self.serve(&server).await
    }

    /// Read frames until the welcome frame for `connect_id` arrives
    async fn await_welcome(&mut self, connect_id: &str) -> StreamResult<()> {
        loop {
            let text = self
                .transport
                .recv()
                .await?
                .ok_or_else(|| StreamError::Transport("closed before welcome".to_string()))?;

            let frame = match InboundFrame::parse(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping malformed frame during handshake: {}", e);
                    continue;
                }
            };

            match frame.frame_type {
                FrameType::Welcome => match frame.id.as_deref() {
                    Some(id) if id != connect_id => {
                        return Err(StreamError::protocol(format!(
                            "welcome for connect id {} while expecting {}",
                            id, connect_id
                        )))
                    }
                    _ => return Ok(()),
                },
                FrameType::Error => {
                    return Err(StreamError::server_rejection(
                        None,
                        frame.id.clone(),
                        frame.code,
                        frame.error_message(),
                    ))
                }
                other => debug!("Ignoring {:?} frame before welcome", other),
            }
        }
    }

    /// Enter `Connected` and replay the registry onto the new connection
    async fn on_connected(&mut self, connect_id: &str, server: &InstanceServer) -> StreamResult<()> {
        let reconnected = self.generation > 0;
        self.generation += 1;
        self.retries.connected();

        // Everything queued so far is covered by the replay below
        while self.commands.try_recv().is_ok() {}
        let topics = self.shared.registry.write().begin_generation(self.generation);

        info!("Connected (connect id {})", connect_id);
        self.shared.set_state(ConnectionState::Connected);
        self.shared.emit(ConnectionEvent::Connected {
            connect_id: connect_id.to_string(),
            endpoint: server.endpoint.clone(),
        });

        for (topic, private) in &topics {
            self.send_subscribe(topic, *private).await?;
        }

        if reconnected {
            info!("Restored {} subscription(s)", topics.len());
            self.shared.emit(ConnectionEvent::SubscriptionsRestored {
                count: topics.len(),
            });
        }

        Ok(())
    }

    /// Multiplex heartbeat, commands and inbound frames until the connection dies
    async fn serve(&mut self, server: &InstanceServer) -> StreamError {
        let period = server.ping_interval().max(MIN_PING_INTERVAL);
        let pong_timeout = server.ping_timeout();
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut awaiting_pong: Option<String> = None;
        let mut pong_deadline = Instant::now();
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                biased;

                _ = sleep_until(pong_deadline), if awaiting_pong.is_some() => {
                    awaiting_pong = None;
                    missed += 1;
                    warn!("No pong within {:?} ({} missed)", pong_timeout, missed);
                    if missed >= self.config.max_missed_pongs.max(1) {
                        self.shared.emit(ConnectionEvent::Disconnected {
                            reason: DisconnectReason::HeartbeatTimeout,
                        });
                        return StreamError::HeartbeatTimeout { timeout: pong_timeout };
                    }
                }

                Some(command) = self.commands.recv() => {
                    if let Err(e) = self.handle_command(command).await {
                        return self.lost(e);
                    }
                }

                _ = ping.tick() => {
                    if awaiting_pong.is_none() {
                        let id = self.next_request_id();
                        if let Err(e) = self.send_frame(&PingRequest::new(id.clone())).await {
                            return self.lost(e);
                        }
                        pong_deadline = Instant::now() + pong_timeout;
                        awaiting_pong = Some(id);
                    }
                }

                frame = self.transport.recv() => match frame {
                    Ok(Some(text)) => match self.router.route(&text) {
                        Routed::Pong(id) => {
                            let expected = awaiting_pong.as_deref();
                            if id.is_none() || id.as_deref() == expected {
                                awaiting_pong = None;
                                missed = 0;
                            } else {
                                debug!("Ignoring pong {:?} while expecting {:?}", id, expected);
                            }
                        }
                        Routed::Rejected(e) if e.requires_reconnect() => {
                            warn!("Server rejected the session: {}", e);
                            self.shared.emit(ConnectionEvent::Disconnected {
                                reason: DisconnectReason::AuthRejected,
                            });
                            return e;
                        }
                        _ => {}
                    },
                    Ok(None) => {
                        info!("Server closed connection");
                        self.shared.emit(ConnectionEvent::Disconnected {
                            reason: DisconnectReason::ServerClosed,
                        });
                        return StreamError::Transport("server closed the connection".to_string());
                    }
                    Err(e) => return self.lost(e.into()),
                },
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> StreamResult<()> {
        match command {
            Command::Subscribe { topic } => {
                let claim = self
                    .shared
                    .registry
                    .write()
                    .claim_for_send(&topic, self.generation);
                if let Some(private) = claim {
                    self.send_subscribe(&topic, private).await?;
                }
            }
            Command::Unsubscribe { topic, private } => {
                let id = self.next_request_id();
                self.shared
                    .registry
                    .write()
                    .track(id.clone(), topic.clone(), RequestKind::Unsubscribe);
                self.send_frame(&UnsubscribeRequest::new(id, topic, private))
                    .await?;
            }
        }
        Ok(())
    }

    async fn send_subscribe(&mut self, topic: &str, private: bool) -> StreamResult<()> {
        let id = self.next_request_id();
        self.shared
            .registry
            .write()
            .track(id.clone(), topic, RequestKind::Subscribe);
        self.send_frame(&SubscribeRequest::new(id, topic, private))
            .await
    }

    async fn send_frame<T: Serialize + Sync>(&mut self, frame: &T) -> StreamResult<()> {
        let text = serde_json::to_string(frame).map_err(|e| StreamError::protocol(e.to_string()))?;
        debug!("Sending {}", text);
        self.transport.send(&text).await.map_err(StreamError::from)
    }

    /// Report a lost connection and pass the error through
    fn lost(&self, error: StreamError) -> StreamError {
        error!("Connection lost: {}", error);
        self.shared.emit(ConnectionEvent::Disconnected {
            reason: DisconnectReason::NetworkError(error.to_string()),
        });
        error
    }

    fn fail(&self, error: StreamError) {
        error!("Giving up: {}", error);
        *self.shared.terminal.lock() = Some(error.clone());
        self.shared.emit(ConnectionEvent::ReconnectFailed {
            error: error.to_string(),
        });
        self.shared.emit(error);
        self.shared.shut_down();
    }

    async fn close_transport(&mut self) {
        if !self.transport.is_connected() {
            return;
        }
        match timeout(self.config.transport_timeout, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing transport: {}", e),
            Err(_) => debug!("Timed out closing transport"),
        }
    }

    /// Unique request id: millisecond clock followed by a sequence number
    fn next_request_id(&mut self) -> String {
        self.request_seq += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        format!("{}{:06}", millis, self.request_seq % 1_000_000)
    }
}

/// Resolves once shutdown is requested or the requesting side is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config() {
        let config = StreamConfig::new()
            .with_private(true)
            .with_connect_timeout(Duration::from_secs(5))
            .with_max_missed_pongs(0);

        assert!(config.private);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.max_missed_pongs, 1);
    }

    #[test]
    fn test_default_stream_config() {
        let config = StreamConfig::default();
        assert!(!config.private);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.transport_timeout, Duration::from_secs(10));
        assert_eq!(config.max_missed_pongs, 1);
        assert!(config.reconnect.max_attempts.is_none());
    }

    #[test]
    fn test_closed_state_is_sticky() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = Shared::new(tx);
        shared.set_state(ConnectionState::Connecting);
        assert_eq!(*shared.state.borrow(), ConnectionState::Connecting);

        shared.set_state(ConnectionState::Closed);
        shared.set_state(ConnectionState::Reconnecting);
        assert_eq!(*shared.state.borrow(), ConnectionState::Closed);
    }
}
