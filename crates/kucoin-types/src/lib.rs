//! Shared types for the KuCoin WebSocket push API
//!
//! This crate holds the wire-level vocabulary used across the workspace.
//! It has no networking dependencies and can be used on its own to decode
//! captured frames.
//!
//! # Key Types
//!
//! - [`ConnectionToken`], [`InstanceServer`] - Result of a bullet token request
//! - [`SubscribeRequest`], [`UnsubscribeRequest`], [`PingRequest`] - Outbound frames
//! - [`InboundFrame`], [`FrameType`] - Decoded inbound frames
//! - [`StreamMessage`] - Data event handed to subscribers
//! - [`topic_match`], [`is_private_topic`] - Topic routing rules
//! - [`StreamError`], [`ServerErrorCode`] - Error taxonomy
//! - [`TickerData`], [`TradeMatch`] - Typed payloads for common topics

pub mod error;
pub mod error_codes;
pub mod messages;
pub mod payloads;
pub mod topic;

// Re-export commonly used types
pub use error::*;
pub use error_codes::*;
pub use messages::*;
pub use payloads::*;
pub use topic::*;

// Re-export rust_decimal for users
pub use rust_decimal::Decimal;
