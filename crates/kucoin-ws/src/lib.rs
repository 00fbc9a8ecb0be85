//! WebSocket streaming client for the KuCoin push API
//!
//! This crate keeps one WebSocket connection alive on behalf of many topic
//! subscribers. It fetches a connection token, keeps the server heartbeat,
//! reconnects with backoff across the advertised endpoints and restores
//! every subscription after a reconnect.
//!
//! # Features
//!
//! - Automatic reconnection with exponential backoff and endpoint fallback
//! - Subscription registry with restoration after reconnect
//! - Exact and `:all` wildcard topic routing
//! - Event channel for connection and subscription lifecycle
//!
//! # Example
//!
//! ```no_run
//! use kucoin_auth::BulletTokenProvider;
//! use kucoin_types::TickerData;
//! use kucoin_ws::SocketManager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(BulletTokenProvider::from_env()?);
//!     let manager = SocketManager::create(provider, false).await?;
//!
//!     let handle = manager.subscribe("/market/ticker:BTC-USDT", |msg| {
//!         if let Ok(ticker) = msg.decode::<TickerData>() {
//!             println!("BTC-USDT {}", ticker.price);
//!         }
//!     })?;
//!     handle.acknowledged().await;
//!
//!     let mut events = manager.take_event_receiver().unwrap();
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod endpoint;
pub mod events;
pub mod manager;
pub mod reconnect;
pub mod router;
pub mod subscription;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types
pub use connection::{ConnectionState, StreamConfig};
pub use events::{ConnectionEvent, DisconnectReason, Event, SubscriptionEvent};
pub use manager::SocketManager;
pub use reconnect::{NextStep, ReconnectConfig, ReconnectTracker};
pub use router::{MessageRouter, Routed};
pub use subscription::{Callback, Subscription, SubscriptionHandle, SubscriptionRegistry};
pub use transport::{Transport, TransportError, WsTransport};

pub use kucoin_auth::{BulletTokenProvider, TokenProvider};
pub use kucoin_types::{StreamError, StreamMessage, StreamResult};

/// Commonly used types in one import
pub mod prelude {
    pub use crate::{
        ConnectionEvent, ConnectionState, DisconnectReason, Event, ReconnectConfig,
        SocketManager, StreamConfig, SubscriptionEvent, SubscriptionHandle,
    };
    pub use kucoin_auth::{AuthError, BulletTokenProvider, TokenProvider};
    pub use kucoin_types::{
        StreamError, StreamMessage, StreamResult, TickerData, TradeMatch,
    };
}
