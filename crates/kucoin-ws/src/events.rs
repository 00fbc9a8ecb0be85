//! Connection, subscription and error events

use kucoin_types::StreamError;
use std::time::Duration;

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server closed the connection
    ServerClosed,
    /// Network error occurred
    NetworkError(String),
    /// No pong received within the endpoint's ping timeout
    HeartbeatTimeout,
    /// Server rejected the session token
    AuthRejected,
    /// Client requested shutdown
    Shutdown,
}

/// Connection lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Welcome frame received, connection usable
    Connected {
        /// Connect id echoed by the server
        connect_id: String,
        /// Endpoint URL, without token
        endpoint: String,
    },
    /// Connection was lost
    Disconnected {
        /// Reason for disconnection
        reason: DisconnectReason,
    },
    /// Attempting to reconnect
    Reconnecting {
        /// Current attempt number (1-indexed)
        attempt: u32,
        /// Delay before this attempt
        delay: Duration,
    },
    /// Subscriptions re-sent on a new connection
    SubscriptionsRestored {
        /// Number of subscriptions restored
        count: usize,
    },
    /// Reconnection gave up
    ReconnectFailed {
        /// Final error
        error: String,
    },
    /// Manager closed, no further events follow
    Closed,
}

/// Subscription-specific events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Subscription confirmed by server
    Acknowledged {
        /// Topic
        topic: String,
    },
    /// Unsubscribe confirmed by server
    Unsubscribed {
        /// Topic
        topic: String,
    },
}

/// Combined event type for the event stream
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connection-related event
    Connection(ConnectionEvent),
    /// Subscription-related event
    Subscription(SubscriptionEvent),
    /// Error surfaced to the caller
    Error(StreamError),
}

impl From<ConnectionEvent> for Event {
    fn from(event: ConnectionEvent) -> Self {
        Event::Connection(event)
    }
}

impl From<SubscriptionEvent> for Event {
    fn from(event: SubscriptionEvent) -> Self {
        Event::Subscription(event)
    }
}

impl From<StreamError> for Event {
    fn from(error: StreamError) -> Self {
        Event::Error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_conversions() {
        let event: Event = ConnectionEvent::Closed.into();
        assert_eq!(event, Event::Connection(ConnectionEvent::Closed));

        let event: Event = StreamError::Closed.into();
        assert!(matches!(event, Event::Error(StreamError::Closed)));

        let event: Event = SubscriptionEvent::Acknowledged {
            topic: "/market/ticker:BTC-USDT".into(),
        }
        .into();
        assert!(matches!(event, Event::Subscription(_)));
    }
}
