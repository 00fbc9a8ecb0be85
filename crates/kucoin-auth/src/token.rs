//! Connection token provider
//!
//! Push connections are opened against a server-assigned endpoint with a
//! short-lived token obtained from the REST "bullet" endpoints.

use crate::error::{AuthError, AuthResult};
use crate::signer::RequestSigner;
use async_trait::async_trait;
use kucoin_types::{ConnectionToken, InstanceServer};
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

const BASE_URL: &str = "https://api.kucoin.com";
const PUBLIC_PATH: &str = "/api/v1/bullet-public";
const PRIVATE_PATH: &str = "/api/v1/bullet-private";
const SUCCESS_CODE: &str = "200000";

/// Counter mixed into connect ids so two ids in the same millisecond differ
static CONNECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Source of connection tokens
///
/// Called once per connection attempt; implementations must not cache
/// tokens across calls for longer than the server keeps them valid.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a fresh token for a public or private connection
    async fn get_token(&self, private: bool) -> AuthResult<ConnectionToken>;
}

#[async_trait]
impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    async fn get_token(&self, private: bool) -> AuthResult<ConnectionToken> {
        (**self).get_token(private).await
    }
}

/// Generate a connect id the server will echo in its welcome frame
pub fn next_connect_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let counter = CONNECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 1000;
    format!("{}{:03}", millis, counter)
}

/// Response envelope of the bullet endpoints
#[derive(Debug, Deserialize)]
struct BulletResponse {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<BulletData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulletData {
    token: String,
    instance_servers: Vec<InstanceServer>,
}

impl BulletResponse {
    fn into_token(self) -> AuthResult<ConnectionToken> {
        if self.code != SUCCESS_CODE {
            return Err(AuthError::from_api(
                self.code,
                self.msg.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let data = self
            .data
            .ok_or_else(|| AuthError::Parse("Missing data in response".to_string()))?;

        if data.instance_servers.is_empty() {
            return Err(AuthError::Parse("No instance servers in response".to_string()));
        }

        Ok(ConnectionToken::new(
            data.token,
            data.instance_servers,
            next_connect_id(),
        ))
    }
}

/// Token provider backed by the REST bullet endpoints
///
/// Public tokens need no credentials. Private tokens need a
/// [`RequestSigner`] that produces the authentication headers.
///
/// # Example
///
/// ```no_run
/// use kucoin_auth::{BulletTokenProvider, TokenProvider};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = BulletTokenProvider::new()?;
/// let token = provider.get_token(false).await?;
/// println!("{} endpoints available", token.endpoints.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BulletTokenProvider {
    client: Client,
    base_url: String,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl std::fmt::Debug for BulletTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulletTokenProvider")
            .field("base_url", &self.base_url)
            .field("signer", &self.signer.as_ref().map(|_| "..."))
            .finish()
    }
}

impl BulletTokenProvider {
    /// Create a provider for the production REST API
    pub fn new() -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("kucoin-auth/0.1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: BASE_URL.to_string(),
            signer: None,
        })
    }

    /// Create a provider, honouring `KUCOIN_API_URL` if set
    pub fn from_env() -> AuthResult<Self> {
        let provider = Self::new()?;
        match std::env::var("KUCOIN_API_URL") {
            Ok(url) if !url.trim().is_empty() => Ok(provider.with_base_url(url)),
            _ => Ok(provider),
        }
    }

    /// Override the REST base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Attach a signer for private tokens
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// REST base URL in use
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TokenProvider for BulletTokenProvider {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn get_token(&self, private: bool) -> AuthResult<ConnectionToken> {
        let path = if private { PRIVATE_PATH } else { PUBLIC_PATH };
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.client.post(&url);
        if private {
            let signer = self.signer.as_ref().ok_or(AuthError::MissingSigner)?;
            for (name, value) in signer.sign("POST", path, "")? {
                request = request.header(name, value);
            }
        }

        debug!("Requesting connection token");

        let response: BulletResponse = request.send().await?.json().await?;
        let token = response.into_token()?;

        debug!(
            "Got connection token with {} endpoint(s)",
            token.endpoints.len()
        );

        Ok(token)
    }
}
