//! In-memory transport and token provider for tests
//!
//! [`MockServer`] plays the push server: every `connect` on a
//! [`MockTransport`] opens a new scripted connection that the test can feed
//! frames into, drop, or inspect.

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use kucoin_auth::{next_connect_id, AuthError, AuthResult, TokenProvider};
use kucoin_types::{ConnectionToken, InstanceServer};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Inbound = Result<Option<String>, TransportError>;

struct MockConnection {
    url: String,
    sent: Vec<String>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

struct ServerState {
    connections: Vec<MockConnection>,
    attempted_urls: Vec<String>,
    fail_connects: usize,
    auto_welcome: bool,
    auto_ack: bool,
    muted_pongs: HashSet<usize>,
    rejected_topics: HashMap<String, i64>,
}

/// Handle to the scripted server behind one or more mock transports
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Server that welcomes, acks and pongs automatically
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                connections: Vec::new(),
                attempted_urls: Vec::new(),
                fail_connects: 0,
                auto_welcome: true,
                auto_ack: true,
                muted_pongs: HashSet::new(),
                rejected_topics: HashMap::new(),
            })),
        }
    }

    /// Create a transport connected to this server
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            server: self.clone(),
            inbound: None,
            index: None,
        }
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Stop sending welcome frames on new connections
    pub fn without_welcome(self) -> Self {
        self.state.lock().auto_welcome = false;
        self
    }

    /// Stop acknowledging subscribe requests
    pub fn without_ack(self) -> Self {
        self.state.lock().auto_ack = false;
        self
    }

    /// Never answer pings on the connection with the given index
    pub fn mute_pongs_on(&self, connection: usize) {
        self.state.lock().muted_pongs.insert(connection);
    }

    /// Answer subscribes to `topic` with an error frame carrying `code`
    pub fn reject_topic(&self, topic: impl Into<String>, code: i64) {
        self.state.lock().rejected_topics.insert(topic.into(), code);
    }

    /// Push a frame on the newest connection
    pub fn push(&self, frame: impl Into<String>) {
        self.deliver(Ok(Some(frame.into())));
    }

    /// Simulate a network failure on the newest connection
    pub fn drop_connection(&self) {
        self.deliver(Err(TransportError::Receive("connection reset".into())));
    }

    /// Simulate a clean close by the server on the newest connection
    pub fn close_connection(&self) {
        self.deliver(Ok(None));
    }

    /// Number of connections successfully opened so far
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// URLs of every connection attempt, failed ones included
    pub fn attempted_urls(&self) -> Vec<String> {
        self.state.lock().attempted_urls.clone()
    }

    /// URL of an opened connection
    pub fn url(&self, connection: usize) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(connection)
            .map(|c| c.url.clone())
    }

    /// Frames the client sent on a connection, parsed as JSON
    pub fn sent(&self, connection: usize) -> Vec<Value> {
        self.state
            .lock()
            .connections
            .get(connection)
            .map(|c| {
                c.sent
                    .iter()
                    .filter_map(|text| serde_json::from_str(text).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Frames of one request type sent on a connection
    pub fn sent_of_type(&self, connection: usize, kind: &str) -> Vec<Value> {
        self.sent(connection)
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    /// Topics subscribed on a connection, in send order
    pub fn subscribed_topics(&self, connection: usize) -> Vec<String> {
        self.sent_of_type(connection, "subscribe")
            .iter()
            .filter_map(|frame| frame["topic"].as_str().map(str::to_string))
            .collect()
    }

    fn deliver(&self, item: Inbound) {
        if let Some(conn) = self.state.lock().connections.last() {
            let _ = conn.inbound.send(item);
        }
    }
}

/// Transport whose connections live in a [`MockServer`]
pub struct MockTransport {
    server: MockServer,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    index: Option<usize>,
}

fn connect_id_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let id = parsed
        .query_pairs()
        .find(|(k, _)| k == "connectId")
        .map(|(_, v)| v.into_owned());
    id
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        self.inbound = None;
        self.index = None;

        let mut state = self.server.state.lock();
        state.attempted_urls.push(url.to_string());
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Connect {
                endpoint: url.to_string(),
                reason: "mock connection refused".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if state.auto_welcome {
            let welcome = json!({"id": connect_id_of(url), "type": "welcome"});
            let _ = tx.send(Ok(Some(welcome.to_string())));
        }

        state.connections.push(MockConnection {
            url: url.to_string(),
            sent: Vec::new(),
            inbound: tx,
        });
        self.index = Some(state.connections.len() - 1);
        self.inbound = Some(rx);
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let index = self.index.ok_or(TransportError::NotConnected)?;
        let mut state = self.server.state.lock();
        let auto_ack = state.auto_ack;
        let muted = state.muted_pongs.contains(&index);
        let frame: Value = serde_json::from_str(message)
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let rejection = frame["topic"]
            .as_str()
            .and_then(|topic| state.rejected_topics.get(topic).copied());

        let conn = state
            .connections
            .get_mut(index)
            .ok_or(TransportError::NotConnected)?;
        conn.sent.push(message.to_string());

        let id = frame["id"].clone();
        let reply = match frame["type"].as_str() {
            Some("ping") if !muted => Some(json!({"id": id, "type": "pong"})),
            Some("subscribe") => match rejection {
                Some(code) => Some(json!({
                    "id": id,
                    "type": "error",
                    "code": code,
                    "data": format!("topic {} is not found", frame["topic"].as_str().unwrap_or_default()),
                })),
                None if auto_ack => Some(json!({"id": id, "type": "ack"})),
                None => None,
            },
            Some("unsubscribe") if auto_ack => Some(json!({"id": id, "type": "ack"})),
            _ => None,
        };

        if let Some(reply) = reply {
            let _ = conn.inbound.send(Ok(Some(reply.to_string())));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        let inbound = self.inbound.as_mut().ok_or(TransportError::NotConnected)?;
        let item = inbound.recv().await.unwrap_or(Err(TransportError::Dropped));
        if !matches!(item, Ok(Some(_))) {
            self.inbound = None;
            self.index = None;
        }
        item
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inbound = None;
        self.index = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inbound.is_some()
    }
}

/// Token provider returning scripted results
///
/// Once the script runs out every call succeeds with a token for two mock
/// endpoints.
pub struct MockTokenProvider {
    script: Mutex<VecDeque<AuthResult<ConnectionToken>>>,
    ping_interval_ms: u64,
    ping_timeout_ms: u64,
    fetches: AtomicUsize,
    always_fail: bool,
}

impl Default for MockTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTokenProvider {
    /// Provider with a relaxed heartbeat
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            ping_interval_ms: 1_000,
            ping_timeout_ms: 1_000,
            fetches: AtomicUsize::new(0),
            always_fail: false,
        }
    }

    /// Set the heartbeat advertised by the mock endpoints
    pub fn with_ping(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.ping_interval_ms = interval_ms;
        self.ping_timeout_ms = timeout_ms;
        self
    }

    /// Queue an error for the next call
    pub fn push_error(&self, error: AuthError) {
        self.script.lock().push_back(Err(error));
    }

    /// Fail every call with a retryable API error
    pub fn failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Number of token requests served
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn token(&self) -> ConnectionToken {
        ConnectionToken::new(
            "mock-token",
            vec![
                InstanceServer::new(
                    "wss://mock-1.test/endpoint",
                    self.ping_interval_ms,
                    self.ping_timeout_ms,
                ),
                InstanceServer::new(
                    "wss://mock-2.test/endpoint",
                    self.ping_interval_ms,
                    self.ping_timeout_ms,
                ),
            ],
            next_connect_id(),
        )
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn get_token(&self, _private: bool) -> AuthResult<ConnectionToken> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(AuthError::from_api("500000", "Internal Server Error"));
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.token()))
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
