//! Request and response frames for the KuCoin WebSocket push API

use crate::error::{StreamError, StreamResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Connection Token
// ============================================================================

/// A push server advertised by the bullet endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceServer {
    /// WebSocket URL without query string
    pub endpoint: String,
    /// Whether the endpoint uses TLS
    #[serde(default)]
    pub encrypt: bool,
    /// Transport protocol, always "websocket" today
    #[serde(default)]
    pub protocol: String,
    /// Recommended client ping interval in milliseconds
    pub ping_interval: u64,
    /// Time the server waits for a ping before dropping us, in milliseconds
    pub ping_timeout: u64,
}

impl InstanceServer {
    /// Create an endpoint description
    pub fn new(endpoint: impl Into<String>, ping_interval_ms: u64, ping_timeout_ms: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            encrypt: true,
            protocol: "websocket".to_string(),
            ping_interval: ping_interval_ms,
            ping_timeout: ping_timeout_ms,
        }
    }

    /// Ping interval as a duration
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    /// Pong deadline as a duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }
}

/// Short-lived credentials for opening one push connection
///
/// Fetched fresh for every connection attempt and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionToken {
    /// Bearer token appended to the connect URL
    pub token: String,
    /// Candidate endpoints, in server preference order
    pub endpoints: Vec<InstanceServer>,
    /// Client-chosen id the server echoes in its welcome frame
    pub connect_id: String,
}

impl ConnectionToken {
    /// Create a token
    pub fn new(
        token: impl Into<String>,
        endpoints: Vec<InstanceServer>,
        connect_id: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            endpoints,
            connect_id: connect_id.into(),
        }
    }

    /// Pick the endpoint for the given attempt, cycling through the list
    pub fn endpoint(&self, attempt: usize) -> Option<&InstanceServer> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.endpoints.get(attempt % self.endpoints.len())
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("token", &"***")
            .field("endpoints", &self.endpoints)
            .field("connect_id", &self.connect_id)
            .finish()
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Subscribe request frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Correlation id, echoed in the ack or error frame
    pub id: String,
    /// Always "subscribe"
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Topic to subscribe to
    pub topic: String,
    /// Whether the topic lives on the private channel
    pub private_channel: bool,
    /// Ask the server for an ack frame
    pub response: bool,
}

impl SubscribeRequest {
    /// Create a subscribe request that asks for an ack
    pub fn new(id: impl Into<String>, topic: impl Into<String>, private_channel: bool) -> Self {
        Self {
            id: id.into(),
            kind: "subscribe",
            topic: topic.into(),
            private_channel,
            response: true,
        }
    }
}

/// Unsubscribe request frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    /// Correlation id
    pub id: String,
    /// Always "unsubscribe"
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Topic to drop
    pub topic: String,
    /// Whether the topic lives on the private channel
    pub private_channel: bool,
    /// Ask the server for an ack frame
    pub response: bool,
}

impl UnsubscribeRequest {
    /// Create an unsubscribe request
    pub fn new(id: impl Into<String>, topic: impl Into<String>, private_channel: bool) -> Self {
        Self {
            id: id.into(),
            kind: "unsubscribe",
            topic: topic.into(),
            private_channel,
            response: true,
        }
    }
}

/// Application-level keepalive
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    /// Correlation id, echoed in the pong
    pub id: String,
    /// Always "ping"
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl PingRequest {
    /// Create a ping with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "ping",
        }
    }
}

// ============================================================================
// Inbound Frames
// ============================================================================

/// Classification of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// First frame after connect, echoes the connect id
    Welcome,
    /// Subscribe/unsubscribe accepted
    Ack,
    /// Request rejected or connection-level failure
    Error,
    /// Answer to a ping
    Pong,
    /// Pushed data event
    Message,
    /// Server notice (maintenance announcements and the like)
    Notice,
}

impl FrameType {
    fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "welcome" => Some(Self::Welcome),
            "ack" => Some(Self::Ack),
            "error" => Some(Self::Error),
            "pong" => Some(Self::Pong),
            "message" => Some(Self::Message),
            "notice" => Some(Self::Notice),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default, deserialize_with = "string_or_number")]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, deserialize_with = "code_value")]
    code: Option<i64>,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Frame classification
    pub frame_type: FrameType,
    /// Correlation id (welcome, ack, error, pong)
    pub id: Option<String>,
    /// Topic of a data event, or of the request an error refers to
    pub topic: Option<String>,
    /// Event subject, e.g. "trade.ticker"
    pub subject: Option<String>,
    /// "public" or "private" on data events
    pub channel_type: Option<String>,
    /// Opaque payload
    pub data: Value,
    /// Error code on error frames
    pub code: Option<i64>,
}

impl InboundFrame {
    /// Parse a frame from its JSON text
    ///
    /// A frame without a `type` but carrying a `code` is an error frame.
    pub fn parse(text: &str) -> StreamResult<Self> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| StreamError::Protocol {
            message: e.to_string(),
            raw: Some(text.to_string()),
        })?;

        let frame_type = match raw.kind.as_deref() {
            Some(kind) => FrameType::from_wire(kind).ok_or_else(|| StreamError::Protocol {
                message: format!("unknown frame type: {}", kind),
                raw: Some(text.to_string()),
            })?,
            None if raw.code.is_some() => FrameType::Error,
            None => {
                return Err(StreamError::Protocol {
                    message: "frame has neither type nor code".to_string(),
                    raw: Some(text.to_string()),
                })
            }
        };

        if frame_type == FrameType::Message && raw.topic.is_none() {
            return Err(StreamError::Protocol {
                message: "data frame without topic".to_string(),
                raw: Some(text.to_string()),
            });
        }

        Ok(Self {
            frame_type,
            id: raw.id,
            topic: raw.topic,
            subject: raw.subject,
            channel_type: raw.channel_type,
            data: raw.data,
            code: raw.code,
        })
    }

    /// Human-readable error text of an error frame
    pub fn error_message(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => "no details".to_string(),
            other => other.to_string(),
        }
    }

    /// Convert a data frame into a subscriber-facing message
    pub fn into_message(self) -> Option<StreamMessage> {
        if self.frame_type != FrameType::Message {
            return None;
        }
        Some(StreamMessage {
            topic: self.topic?,
            subject: self.subject,
            channel_type: self.channel_type,
            data: self.data,
        })
    }
}

/// A pushed data event, as delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Topic the event was published on
    pub topic: String,
    /// Event subject
    pub subject: Option<String>,
    /// "public" or "private"
    pub channel_type: Option<String>,
    /// Opaque payload
    pub data: Value,
}

impl StreamMessage {
    /// Decode the payload into a typed structure
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Instrument the event refers to
    ///
    /// Taken from the topic suffix, or from the subject for wildcard topics
    /// where the server puts the symbol there.
    pub fn symbol(&self) -> Option<&str> {
        let (_, suffix) = self.topic.split_once(':')?;
        if suffix == crate::topic::WILDCARD {
            return self.subject.as_deref();
        }
        Some(suffix)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn code_value<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}
