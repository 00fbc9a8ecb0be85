//! Connection token provider for the KuCoin WebSocket push API
//!
//! Every push connection needs a short-lived token and a list of endpoints,
//! obtained from the REST bullet endpoints. This crate wraps that request
//! behind the [`TokenProvider`] trait so the streaming client can be driven
//! by any token source.
//!
//! # Example
//!
//! ```no_run
//! use kucoin_auth::{BulletTokenProvider, TokenProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = BulletTokenProvider::from_env()?;
//!
//!     // Public token, no credentials needed
//!     let token = provider.get_token(false).await?;
//!     println!("Endpoint: {}", token.endpoints[0].endpoint);
//!
//!     Ok(())
//! }
//! ```

mod error;
mod signer;
mod token;

pub use error::{AuthError, AuthResult};
pub use signer::{RequestSigner, StaticHeaders};
pub use token::{next_connect_id, BulletTokenProvider, TokenProvider};
