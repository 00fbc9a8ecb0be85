//! Socket manager: the public entry point
//!
//! A [`SocketManager`] owns one background connection task, the subscription
//! registry shared with it, and the event channel.

use crate::connection::{Command, ConnectionManager, ConnectionState, Shared, StreamConfig};
use crate::events::Event;
use crate::subscription::{Subscription, SubscriptionHandle};
use crate::transport::{Transport, WsTransport};

use kucoin_auth::TokenProvider;
use kucoin_types::{is_private_topic, validate_topic, StreamError, StreamMessage, StreamResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

enum Lifecycle {
    /// Not started; holds the loop until the first subscribe or `start`
    Idle(Box<ConnectionManager>),
    Running(JoinHandle<()>),
    Closing,
    Closed,
}

/// Multiplexes topic subscriptions over one self-healing WebSocket connection
///
/// # Example
///
/// ```no_run
/// use kucoin_auth::BulletTokenProvider;
/// use kucoin_ws::SocketManager;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = Arc::new(BulletTokenProvider::from_env()?);
/// let manager = SocketManager::create(provider, false).await?;
///
/// manager.subscribe("/market/ticker:BTC-USDT", |msg| {
///     println!("{}: {}", msg.topic, msg.data);
/// })?;
///
/// // ...
/// manager.close().await;
/// # Ok(())
/// # }
/// ```
pub struct SocketManager {
    config: StreamConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl SocketManager {
    /// Create a manager without connecting
    ///
    /// The connection is opened by [`start`](Self::start) or the first
    /// subscription.
    pub fn new(provider: Arc<dyn TokenProvider>, config: StreamConfig) -> Self {
        let transport = WsTransport::new().with_timeout(config.transport_timeout);
        Self::with_transport(provider, config, Box::new(transport))
    }

    /// Create a manager over a custom transport
    pub fn with_transport(
        provider: Arc<dyn TokenProvider>,
        config: StreamConfig,
        transport: Box<dyn Transport>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared::new(event_tx));

        let connection = ConnectionManager::new(
            provider,
            transport,
            config.clone(),
            shared.clone(),
            command_rx,
            shutdown_rx,
        );

        Self {
            config,
            shared,
            commands: command_tx,
            shutdown: shutdown_tx,
            lifecycle: Mutex::new(Lifecycle::Idle(Box::new(connection))),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Create a manager and wait until it is connected
    pub async fn create(provider: Arc<dyn TokenProvider>, private: bool) -> StreamResult<Self> {
        Self::create_with_config(provider, StreamConfig::new().with_private(private)).await
    }

    /// Create a manager with explicit configuration and wait until it is connected
    pub async fn create_with_config(
        provider: Arc<dyn TokenProvider>,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        let manager = Self::new(provider, config);
        manager.connect().await?;
        Ok(manager)
    }

    /// Start the connection and wait for the first `Connected` state
    ///
    /// Fails with the terminal error if the manager gives up, or with
    /// [`StreamError::ConnectTimeout`] once the configured connect timeout
    /// passes. The manager is closed on failure.
    pub async fn connect(&self) -> StreamResult<()> {
        self.start()?;

        let mut state = self.shared.state.subscribe();
        let limit = self.config.connect_timeout;
        let reached = tokio::time::timeout(
            limit,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed)),
        )
        .await
        .map(|r| r.map(|s| *s));

        match reached {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => {
                self.close().await;
                Err(self.terminal_error().unwrap_or(StreamError::Closed))
            }
            Err(_) => {
                self.close().await;
                Err(StreamError::ConnectTimeout(limit))
            }
        }
    }

    /// Spawn the background connection task if it is not running yet
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> StreamResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Closing) {
            Lifecycle::Idle(connection) => {
                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        *lifecycle = Lifecycle::Idle(connection);
                        return Err(StreamError::Transport(format!("no Tokio runtime: {}", e)));
                    }
                };
                debug!("Starting connection task");
                let connection = *connection;
                *lifecycle = Lifecycle::Running(runtime.spawn(connection.run()));
                Ok(())
            }
            Lifecycle::Running(handle) => {
                *lifecycle = Lifecycle::Running(handle);
                Ok(())
            }
            other => {
                *lifecycle = other;
                Err(StreamError::Closed)
            }
        }
    }

    /// Subscribe a callback to a topic
    ///
    /// Private topics are only accepted on a private manager. Returns as soon
    /// as the topic is registered; use the handle to wait for the server's
    /// acknowledgement.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> StreamResult<SubscriptionHandle>
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        let topic = topic.into();
        validate_topic(&topic)?;

        let private = is_private_topic(&topic);
        if private && !self.config.private {
            return Err(StreamError::PrivateTopic(topic));
        }

        self.subscribe_with(topic, private, callback)
    }

    /// Subscribe with an explicit `privateChannel` flag
    pub fn subscribe_with<F>(
        &self,
        topic: impl Into<String>,
        private: bool,
        callback: F,
    ) -> StreamResult<SubscriptionHandle>
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        let topic = topic.into();
        validate_topic(&topic)?;
        if self.state() == ConnectionState::Closed {
            return Err(StreamError::Closed);
        }

        let handle = self
            .shared
            .registry
            .write()
            .register(topic.clone(), private, Arc::new(callback))?;

        if let Err(e) = self.start() {
            self.shared.registry.write().unregister(&topic);
            return Err(e);
        }

        debug!("Subscribed to {}", topic);
        let _ = self.commands.send(Command::Subscribe { topic });
        Ok(handle)
    }

    /// Subscribe to a topic and receive its events on a channel
    pub fn subscribe_channel(
        &self,
        topic: impl Into<String>,
    ) -> StreamResult<(SubscriptionHandle, mpsc::UnboundedReceiver<StreamMessage>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(topic, move |msg: &StreamMessage| {
            let _ = tx.send(msg.clone());
        })?;
        Ok((handle, rx))
    }

    /// Drop a topic
    ///
    /// Returns whether the topic was registered. Unknown topics are ignored.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.shared.registry.write().unregister(topic);
        match removed {
            Some(subscription) => {
                debug!("Unsubscribed from {}", topic);
                let _ = self.commands.send(Command::Unsubscribe {
                    topic: subscription.topic,
                    private: subscription.private,
                });
                true
            }
            None => false,
        }
    }

    /// Close the connection and stop the background task
    ///
    /// When this returns the transport is closed, all timers are cancelled
    /// and no callback will run again. Safe to call more than once and from
    /// several tasks at the same time.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closing);
        match previous {
            Lifecycle::Idle(_) => self.shared.shut_down(),
            Lifecycle::Running(handle) => {
                if let Err(e) = handle.await {
                    debug!("Connection task ended abnormally: {}", e);
                }
                // Also covers topics registered while the task was winding down
                self.shared.shut_down();
            }
            Lifecycle::Closing => {
                let mut state = self.shared.state.subscribe();
                let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
                return;
            }
            Lifecycle::Closed => {
                *self.lifecycle.lock() = Lifecycle::Closed;
                return;
            }
        }

        *self.lifecycle.lock() = Lifecycle::Closed;
        info!("Socket manager closed");
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.event_rx.lock().take()
    }

    /// Copy of the currently registered subscriptions
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.read().snapshot()
    }

    /// Error that made the manager give up, if any
    pub fn terminal_error(&self) -> Option<StreamError> {
        self.shared.terminal.lock().clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ReconnectConfig;
    use crate::testing::{wait_until, MockServer, MockTokenProvider};
    use crate::events::{ConnectionEvent, DisconnectReason, SubscriptionEvent};
    use kucoin_auth::AuthError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> StreamConfig {
        StreamConfig::new()
            .with_connect_timeout(Duration::from_secs(2))
            .with_handshake_timeout(Duration::from_millis(500))
            .with_transport_timeout(Duration::from_millis(500))
            .with_reconnect(
                ReconnectConfig::new()
                    .with_initial_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(50))
                    .with_jitter(0.0),
            )
    }

    fn manager_with(
        server: &MockServer,
        provider: MockTokenProvider,
        config: StreamConfig,
    ) -> SocketManager {
        SocketManager::with_transport(Arc::new(provider), config, Box::new(server.transport()))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&StreamMessage) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_: &StreamMessage| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn ticker_frame(topic: &str, price: &str) -> String {
        json!({
            "type": "message",
            "topic": topic,
            "subject": "trade.ticker",
            "data": {"price": price}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_end_to_end_delivery_exactly_once() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        manager.connect().await.unwrap();
        assert!(manager.is_connected());

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handle = manager
            .subscribe("/market/ticker:BTC-USDT", move |msg: &StreamMessage| {
                sink.lock().push(msg.data.clone());
            })
            .unwrap();

        assert!(tokio::time::timeout(WAIT, handle.acknowledged()).await.unwrap());
        server.push(ticker_frame("/market/ticker:BTC-USDT", "50000"));

        assert!(wait_until(WAIT, || received.lock().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*received.lock(), vec![json!({"price": "50000"})]);

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_buffered() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let (count, cb) = counter();
        manager.subscribe("/market/match:BTC-USDT", cb).unwrap();

        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);
        server.push(ticker_frame("/market/match:BTC-USDT", "1"));
        assert!(wait_until(WAIT, || count.load(Ordering::SeqCst) == 1).await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(server.subscribed_topics(0), vec!["/market/match:BTC-USDT"]);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_wildcard_and_exact_both_delivered() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        manager.connect().await.unwrap();

        let (exact, exact_cb) = counter();
        let (all, all_cb) = counter();
        manager.subscribe("/market/ticker:ETH-USDT", exact_cb).unwrap();
        manager.subscribe("/market/ticker:all", all_cb).unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 2).await);

        server.push(ticker_frame("/market/ticker:ETH-USDT", "3000"));
        assert!(
            wait_until(WAIT, || {
                exact.load(Ordering::SeqCst) == 1 && all.load(Ordering::SeqCst) == 1
            })
            .await
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn test_resubscribe_after_reconnect() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        let mut events = manager.take_event_receiver().unwrap();
        manager.connect().await.unwrap();

        let (btc, btc_cb) = counter();
        let (eth, eth_cb) = counter();
        manager.subscribe("/market/ticker:BTC-USDT", btc_cb).unwrap();
        manager.subscribe("/market/ticker:ETH-USDT", eth_cb).unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 2).await);

        server.drop_connection();
        assert!(wait_until(WAIT, || server.subscribed_topics(1).len() == 2).await);
        let mut restored = server.subscribed_topics(1);
        restored.sort();
        assert_eq!(restored, vec!["/market/ticker:BTC-USDT", "/market/ticker:ETH-USDT"]);

        server.push(ticker_frame("/market/ticker:BTC-USDT", "50001"));
        assert!(wait_until(WAIT, || btc.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(btc.load(Ordering::SeqCst), 1);
        assert_eq!(eth.load(Ordering::SeqCst), 0);
        assert_eq!(manager.subscriptions().len(), 2);

        let events = drain(&mut events);
        assert!(events.contains(&Event::Connection(ConnectionEvent::SubscriptionsRestored {
            count: 2
        })));

        // Second endpoint is used for the first retry
        assert!(server.url(1).unwrap().starts_with("wss://mock-2.test/endpoint"));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_missed_pong_triggers_single_reconnect() {
        let server = MockServer::new();
        server.mute_pongs_on(0);
        let provider = MockTokenProvider::new().with_ping(30, 40);
        let manager = manager_with(&server, provider, test_config());
        let mut events = manager.take_event_receiver().unwrap();
        manager.connect().await.unwrap();

        assert!(wait_until(WAIT, || server.connection_count() == 2).await);
        assert!(wait_until(WAIT, || manager.is_connected()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(server.connection_count(), 2);
        let events = drain(&mut events);
        let reconnects = events
            .iter()
            .filter(|e| matches!(e, Event::Connection(ConnectionEvent::Reconnecting { .. })))
            .count();
        let timeouts = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::Connection(ConnectionEvent::Disconnected {
                        reason: DisconnectReason::HeartbeatTimeout
                    })
                )
            })
            .count();
        assert_eq!(reconnects, 1);
        assert_eq!(timeouts, 1);
        assert!(!server.sent_of_type(1, "ping").is_empty());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_during_backoff() {
        let server = MockServer::new();
        let config = test_config().with_reconnect(
            ReconnectConfig::new()
                .with_initial_delay(Duration::from_secs(10))
                .with_jitter(0.0),
        );
        let manager = manager_with(&server, MockTokenProvider::new(), config);
        let mut events = manager.take_event_receiver().unwrap();
        manager.connect().await.unwrap();

        let (count, cb) = counter();
        manager.subscribe("/market/ticker:BTC-USDT", cb).unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);

        server.drop_connection();
        assert!(wait_until(WAIT, || manager.state() == ConnectionState::Reconnecting).await);

        tokio::time::timeout(Duration::from_secs(1), manager.close())
            .await
            .expect("close must not wait for the backoff");
        assert_eq!(manager.state(), ConnectionState::Closed);

        server.push(ticker_frame("/market/ticker:BTC-USDT", "1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(server.connection_count(), 1);

        let events = drain(&mut events);
        assert_eq!(
            events.last(),
            Some(&Event::Connection(ConnectionEvent::Closed))
        );
        assert!(matches!(
            manager.subscribe("/market/ticker:ETH-USDT", |_: &StreamMessage| {}),
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let server = MockServer::new();
        let manager = Arc::new(manager_with(&server, MockTokenProvider::new(), test_config()));
        manager.connect().await.unwrap();

        let other = manager.clone();
        let (a, b) = tokio::join!(manager.close(), async move { other.close().await });
        let _ = (a, b);
        assert_eq!(manager.state(), ConnectionState::Closed);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        let mut events = manager.take_event_receiver().unwrap();
        manager.connect().await.unwrap();

        assert!(!manager.unsubscribe("/market/ticker:NEVER"));

        let (count, cb) = counter();
        manager.subscribe("/market/ticker:BTC-USDT", cb).unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);
        assert!(manager.unsubscribe("/market/ticker:BTC-USDT"));
        assert!(manager.subscriptions().is_empty());

        assert!(wait_until(WAIT, || server.sent_of_type(0, "unsubscribe").len() == 1).await);
        let frame = &server.sent_of_type(0, "unsubscribe")[0];
        assert_eq!(frame["topic"], "/market/ticker:BTC-USDT");
        assert_eq!(frame["privateChannel"], false);

        server.push(ticker_frame("/market/ticker:BTC-USDT", "1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let events = drain(&mut events);
        assert!(events.contains(&Event::Subscription(SubscriptionEvent::Unsubscribed {
            topic: "/market/ticker:BTC-USDT".into()
        })));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());

        assert_eq!(
            manager.subscribe("", |_: &StreamMessage| {}).unwrap_err(),
            StreamError::EmptyTopic
        );
        assert!(matches!(
            manager.subscribe("/account/balance", |_: &StreamMessage| {}),
            Err(StreamError::PrivateTopic(_))
        ));

        manager.subscribe("/market/ticker:BTC-USDT", |_: &StreamMessage| {}).unwrap();
        assert!(matches!(
            manager.subscribe("/market/ticker:BTC-USDT", |_: &StreamMessage| {}),
            Err(StreamError::DuplicateTopic(_))
        ));
        assert_eq!(manager.subscriptions().len(), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_private_manager_flags() {
        let server = MockServer::new();
        let config = test_config().with_private(true);
        let manager = manager_with(&server, MockTokenProvider::new(), config);
        manager.connect().await.unwrap();

        manager.subscribe("/account/balance", |_: &StreamMessage| {}).unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);

        let frame = &server.sent_of_type(0, "subscribe")[0];
        assert_eq!(frame["privateChannel"], true);
        assert_eq!(frame["response"], true);
        assert!(server.url(0).unwrap().contains("acceptUserMessage=true"));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_server_rejection_surfaces_without_reconnect() {
        let server = MockServer::new();
        server.reject_topic("/market/ticker:FOO", 404);
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        let mut events = manager.take_event_receiver().unwrap();
        manager.connect().await.unwrap();

        manager.subscribe("/market/ticker:FOO", |_: &StreamMessage| {}).unwrap();

        let rejection = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(Event::Error(e @ StreamError::ServerRejection { .. })) = events.recv().await {
                    return e;
                }
            }
        })
        .await
        .unwrap();

        match rejection {
            StreamError::ServerRejection { topic, .. } => {
                assert_eq!(topic.as_deref(), Some("/market/ticker:FOO"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.is_connected());
        assert_eq!(server.connection_count(), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_auth_error_is_terminal() {
        let server = MockServer::new();
        let provider = MockTokenProvider::new();
        provider.push_error(AuthError::InvalidCredentials("bad key".into()));
        let manager = manager_with(&server, provider, test_config());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::Auth(_)));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_token_failures_exhaust() {
        let server = MockServer::new();
        let config = test_config().with_reconnect(
            ReconnectConfig::new()
                .with_initial_delay(Duration::from_millis(5))
                .with_jitter(0.0)
                .with_max_token_failures(3),
        );
        let provider = Arc::new(MockTokenProvider::new().failing());
        let manager =
            SocketManager::with_transport(provider.clone(), config, Box::new(server.transport()));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::ReconnectExhausted { attempts: 3, .. }));
        assert_eq!(provider.fetch_count(), 3);
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_endpoint_fallback_on_connect_failure() {
        let server = MockServer::new();
        server.fail_next_connects(1);
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        manager.connect().await.unwrap();

        let urls = server.attempted_urls();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].starts_with("wss://mock-1.test/endpoint"));
        assert!(urls[1].starts_with("wss://mock-2.test/endpoint"));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_connect_timeout_without_welcome() {
        let server = MockServer::new().without_welcome();
        let config = test_config().with_connect_timeout(Duration::from_millis(150));
        let manager = manager_with(&server, MockTokenProvider::new(), config);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, StreamError::ConnectTimeout(Duration::from_millis(150)));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_subscribe_channel_and_ack_wait() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        manager.connect().await.unwrap();

        let (handle, mut rx) = manager.subscribe_channel("/market/ticker:all").unwrap();
        assert!(tokio::time::timeout(WAIT, handle.acknowledged()).await.unwrap());
        assert!(handle.is_acknowledged());

        server.push(ticker_frame("/market/ticker:SOL-USDT", "150"));
        let msg = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.topic, "/market/ticker:SOL-USDT");
        assert_eq!(msg.data["price"], "150");
        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_pending_ack_waits() {
        let server = MockServer::new().without_ack();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        manager.connect().await.unwrap();

        let handle = manager
            .subscribe("/market/ticker:BTC-USDT", |_: &StreamMessage| {})
            .unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);

        manager.close().await;
        let acked = tokio::time::timeout(Duration::from_millis(500), handle.acknowledged()).await;
        assert_eq!(acked, Ok(false));
        assert!(manager.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_channel_subscriptions() {
        let server = MockServer::new();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        let mut events = manager.take_event_receiver().unwrap();
        manager.connect().await.unwrap();

        let (_handle, mut rx) = manager.subscribe_channel("/market/match:BTC-USDT").unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);

        manager.close().await;
        let next = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(next, Ok(None)));

        let events = drain(&mut events);
        let tail = &events[events.len() - 2..];
        assert_eq!(
            tail,
            &[
                Event::Connection(ConnectionEvent::Disconnected {
                    reason: DisconnectReason::Shutdown,
                }),
                Event::Connection(ConnectionEvent::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_failure_ends_channel_subscriptions() {
        let server = MockServer::new();
        let provider = MockTokenProvider::new();
        provider.push_error(AuthError::InvalidCredentials("bad key".into()));
        let manager = manager_with(&server, provider, test_config());

        let (handle, mut rx) = manager.subscribe_channel("/market/ticker:all").unwrap();

        let next = tokio::time::timeout(WAIT, rx.recv()).await;
        assert!(matches!(next, Ok(None)));
        assert!(!handle.acknowledged().await);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(manager.terminal_error(), Some(StreamError::Auth(_))));
    }

    #[tokio::test]
    async fn test_unacknowledged_without_server_ack() {
        let server = MockServer::new().without_ack();
        let manager = manager_with(&server, MockTokenProvider::new(), test_config());
        manager.connect().await.unwrap();

        let handle = manager
            .subscribe("/market/ticker:BTC-USDT", |_: &StreamMessage| {})
            .unwrap();
        assert!(wait_until(WAIT, || server.subscribed_topics(0).len() == 1).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_acknowledged());
        assert!(!manager.subscriptions()[0].acknowledged);
        manager.close().await;
    }
}
