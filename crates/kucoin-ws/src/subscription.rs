//! Subscription registry
//!
//! The registry is the single source of truth for which topics should be
//! subscribed. It outlives individual connections: after every reconnect the
//! connection manager replays it onto the new socket.

use kucoin_types::{topic_match, StreamError, StreamMessage, StreamResult, TopicMatch};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Consumer callback invoked for every data event on a matching topic
pub type Callback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;

/// Point-in-time view of one registered topic
#[derive(Clone)]
pub struct Subscription {
    /// Topic, exact or wildcard
    pub topic: String,
    /// Sent with `privateChannel=true`
    pub private: bool,
    /// Server acknowledged the subscribe on the current connection
    pub acknowledged: bool,
    /// Consumer handler
    pub callback: Callback,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("private", &self.private)
            .field("acknowledged", &self.acknowledged)
            .finish_non_exhaustive()
    }
}

/// Kind of an in-flight request awaiting ack or error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Subscribe request
    Subscribe,
    /// Unsubscribe request
    Unsubscribe,
}

/// Handle returned by `subscribe`, used to observe the acknowledgement
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    topic: String,
    ack: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    /// Topic this handle refers to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the server acknowledged the subscription on the current connection
    pub fn is_acknowledged(&self) -> bool {
        *self.ack.borrow()
    }

    /// Wait until the server acknowledges the subscription
    ///
    /// Returns `false` if the topic is unsubscribed before that happens.
    pub async fn acknowledged(&self) -> bool {
        let mut rx = self.ack.clone();
        let acked = rx.wait_for(|acked| *acked).await.is_ok();
        acked
    }
}

struct Entry {
    private: bool,
    callback: Callback,
    ack: watch::Sender<bool>,
    /// Connection generation the subscribe frame was last sent on
    sent_generation: Option<u64>,
}

/// Durable map of topic to subscriber state
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Entry>,
    in_flight: HashMap<String, (String, RequestKind)>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription
    ///
    /// Fails with [`StreamError::DuplicateTopic`] if the topic is already registered.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        private: bool,
        callback: Callback,
    ) -> StreamResult<SubscriptionHandle> {
        let topic = topic.into();
        if self.entries.contains_key(&topic) {
            return Err(StreamError::DuplicateTopic(topic));
        }

        let (ack, rx) = watch::channel(false);
        self.entries.insert(
            topic.clone(),
            Entry {
                private,
                callback,
                ack,
                sent_generation: None,
            },
        );

        Ok(SubscriptionHandle { topic, ack: rx })
    }

    /// Remove a subscription, returning it if it existed
    ///
    /// Pending subscribe requests for the topic are forgotten, so a late ack
    /// cannot mark a later registration of the same topic.
    pub fn unregister(&mut self, topic: &str) -> Option<Subscription> {
        let entry = self.entries.remove(topic)?;
        self.in_flight
            .retain(|_, (t, kind)| !(t == topic && *kind == RequestKind::Subscribe));

        let acknowledged = *entry.ack.borrow();
        Some(Subscription {
            topic: topic.to_string(),
            private: entry.private,
            acknowledged,
            callback: entry.callback,
        })
    }

    /// Drop every subscription and pending request
    ///
    /// Waiting handles resolve with `false` and callbacks are released.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.in_flight.clear();
        removed
    }

    /// Whether the topic is registered
    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Number of registered topics
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every registered subscription
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries
            .iter()
            .map(|(topic, entry)| Subscription {
                topic: topic.clone(),
                private: entry.private,
                acknowledged: *entry.ack.borrow(),
                callback: entry.callback.clone(),
            })
            .collect()
    }

    /// Start a new connection generation
    ///
    /// Every topic is marked as sent on `generation` and loses its
    /// acknowledgement. Returns the topics to subscribe on the new connection.
    pub fn begin_generation(&mut self, generation: u64) -> Vec<(String, bool)> {
        self.in_flight.clear();
        self.entries
            .iter_mut()
            .map(|(topic, entry)| {
                entry.sent_generation = Some(generation);
                entry.ack.send_replace(false);
                (topic.clone(), entry.private)
            })
            .collect()
    }

    /// Claim a topic for sending on `generation`
    ///
    /// Returns the private flag if a subscribe frame still needs to go out,
    /// `None` if the topic is gone or was already sent on this connection.
    pub fn claim_for_send(&mut self, topic: &str, generation: u64) -> Option<bool> {
        let entry = self.entries.get_mut(topic)?;
        if entry.sent_generation == Some(generation) {
            return None;
        }
        entry.sent_generation = Some(generation);
        Some(entry.private)
    }

    /// Remember an outbound request until its ack or error arrives
    pub fn track(&mut self, id: impl Into<String>, topic: impl Into<String>, kind: RequestKind) {
        self.in_flight.insert(id.into(), (topic.into(), kind));
    }

    /// Resolve an ack frame
    pub fn acknowledge(&mut self, id: &str) -> Option<(String, RequestKind)> {
        let (topic, kind) = self.in_flight.remove(id)?;
        if kind == RequestKind::Subscribe {
            if let Some(entry) = self.entries.get(&topic) {
                entry.ack.send_replace(true);
            }
        }
        Some((topic, kind))
    }

    /// Resolve an error frame
    pub fn reject(&mut self, id: &str) -> Option<(String, RequestKind)> {
        // Rejected subscriptions stay registered and are retried on the next connection
        self.in_flight.remove(id)
    }

    /// Number of requests awaiting an answer
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Callbacks whose topic matches a data event's topic
    ///
    /// The exact match, if any, comes first, followed by wildcard and
    /// instrument-list matches in topic order.
    pub fn matching(&self, event_topic: &str) -> Vec<(String, Callback)> {
        let mut matches = Vec::new();

        if let Some(entry) = self.entries.get(event_topic) {
            matches.push((event_topic.to_string(), entry.callback.clone()));
        }

        for (topic, entry) in &self.entries {
            if topic_match(topic, event_topic) == TopicMatch::Pattern {
                matches.push((topic.clone(), entry.callback.clone()));
            }
        }

        matches
    }
}
