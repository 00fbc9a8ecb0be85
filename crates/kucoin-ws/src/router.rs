//! Inbound frame classification and dispatch

use crate::events::{Event, SubscriptionEvent};
use crate::subscription::{RequestKind, SubscriptionRegistry};
use kucoin_types::{FrameType, InboundFrame, StreamError};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of routing one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Welcome frame with the echoed connect id
    Welcome(Option<String>),
    /// Pong with the id of the ping it answers
    Pong(Option<String>),
    /// Ack for a tracked or untracked request
    Acknowledged,
    /// Error frame; the error has already been reported
    Rejected(StreamError),
    /// Data event handed to this many callbacks
    Delivered(usize),
    /// Frame carried nothing to act on
    Ignored,
}

/// Decodes frames and dispatches data events to subscriber callbacks
///
/// Callbacks run synchronously, in frame order. A panicking callback is
/// isolated and reported as [`StreamError::Callback`]; the remaining
/// callbacks still receive the event.
pub struct MessageRouter {
    registry: Arc<RwLock<SubscriptionRegistry>>,
    events: mpsc::UnboundedSender<Event>,
}

impl MessageRouter {
    /// Create a router over a shared registry
    pub fn new(
        registry: Arc<RwLock<SubscriptionRegistry>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self { registry, events }
    }

    /// Classify and dispatch one inbound frame
    pub fn route(&self, text: &str) -> Routed {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.emit(e);
                return Routed::Ignored;
            }
        };

        match frame.frame_type {
            FrameType::Welcome => Routed::Welcome(frame.id),
            FrameType::Pong => Routed::Pong(frame.id),
            FrameType::Ack => self.handle_ack(frame.id.as_deref()),
            FrameType::Error => self.handle_error(frame),
            FrameType::Notice => {
                info!("Server notice: {}", frame.data);
                Routed::Ignored
            }
            FrameType::Message => match frame.into_message() {
                Some(message) => Routed::Delivered(self.dispatch(&message)),
                None => Routed::Ignored,
            },
        }
    }

    fn handle_ack(&self, id: Option<&str>) -> Routed {
        let resolved = id.and_then(|id| self.registry.write().acknowledge(id));

        match resolved {
            Some((topic, RequestKind::Subscribe)) => {
                debug!("Subscription acknowledged: {}", topic);
                self.emit(SubscriptionEvent::Acknowledged { topic });
            }
            Some((topic, RequestKind::Unsubscribe)) => {
                debug!("Unsubscribe acknowledged: {}", topic);
                self.emit(SubscriptionEvent::Unsubscribed { topic });
            }
            None => debug!("Ack for unknown request {:?}", id),
        }

        Routed::Acknowledged
    }

    fn handle_error(&self, frame: InboundFrame) -> Routed {
        let message = frame.error_message();
        let tracked = frame
            .id
            .as_deref()
            .and_then(|id| self.registry.write().reject(id));

        let topic = frame.topic.or_else(|| tracked.map(|(topic, _)| topic));
        let error = StreamError::server_rejection(topic, frame.id, frame.code, message);

        warn!("{}", error);
        self.emit(error.clone());
        Routed::Rejected(error)
    }

    fn dispatch(&self, message: &kucoin_types::StreamMessage) -> usize {
        // Lock is released before any callback runs
        let targets = self.registry.read().matching(&message.topic);

        if targets.is_empty() {
            debug!("No subscriber for {}", message.topic);
            return 0;
        }

        let mut delivered = 0;
        for (topic, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!("Callback for {} panicked: {}", topic, reason);
                    self.emit(StreamError::Callback {
                        topic,
                        message: reason,
                    });
                }
            }
        }

        delivered
    }

    fn emit(&self, event: impl Into<Event>) {
        let _ = self.events.send(event.into());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
