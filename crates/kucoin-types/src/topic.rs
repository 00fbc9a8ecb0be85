//! Topic naming and routing rules
//!
//! Topics look like `/market/ticker:BTC-USDT`: a channel prefix, a colon and
//! a comma-separated instrument list. The instrument `all` is a wildcard.

use crate::error::{StreamError, StreamResult};

/// Instrument name that matches every instrument of a channel
pub const WILDCARD: &str = "all";

/// Channel prefixes that only exist on the private (authenticated) connection
pub const PRIVATE_TOPIC_PREFIXES: &[&str] = &[
    "/account/balance",
    "/spotMarket/tradeOrders",
    "/spotMarket/tradeOrdersV2",
    "/spotMarket/advancedOrders",
    "/margin/position",
    "/margin/loan",
];

/// How a subscription topic relates to the topic of a data event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMatch {
    /// Identical topic strings
    Exact,
    /// Same channel, instrument covered by a wildcard or instrument list
    Pattern,
    /// Unrelated
    None,
}

impl TopicMatch {
    /// True unless the topics are unrelated
    pub fn is_match(self) -> bool {
        self != Self::None
    }
}

/// Match a subscription topic against the topic a data event arrived on
pub fn topic_match(subscription: &str, event_topic: &str) -> TopicMatch {
    if subscription == event_topic {
        return TopicMatch::Exact;
    }

    let (Some((sub_prefix, sub_list)), Some((event_prefix, instrument))) =
        (subscription.split_once(':'), event_topic.split_once(':'))
    else {
        return TopicMatch::None;
    };

    if sub_prefix != event_prefix {
        return TopicMatch::None;
    }

    let covered = sub_list
        .split(',')
        .map(str::trim)
        .any(|s| s == WILDCARD || s == instrument);

    if covered {
        TopicMatch::Pattern
    } else {
        TopicMatch::None
    }
}

/// Channel part of a topic (everything before the first colon)
pub fn topic_prefix(topic: &str) -> &str {
    topic.split_once(':').map_or(topic, |(prefix, _)| prefix)
}

/// Whether the topic belongs to a private channel
pub fn is_private_topic(topic: &str) -> bool {
    PRIVATE_TOPIC_PREFIXES.contains(&topic_prefix(topic))
}

/// Reject empty or whitespace-only topics
pub fn validate_topic(topic: &str) -> StreamResult<()> {
    if topic.trim().is_empty() {
        return Err(StreamError::EmptyTopic);
    }
    Ok(())
}
