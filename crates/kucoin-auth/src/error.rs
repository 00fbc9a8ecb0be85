//! Error types for token requests

use kucoin_types::StreamError;

/// REST codes that mean the credentials themselves are unusable
const CREDENTIAL_ERROR_CODES: &[&str] = &[
    "400001", // missing auth headers
    "400003", // KC-API-KEY not exists
    "400004", // invalid KC-API-PASSPHRASE
    "400005", // invalid KC-API-SIGN
    "400006", // IP not in whitelist
    "400007", // access denied
    "411100", // user frozen
];

/// Errors that can occur while obtaining a connection token
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid API credentials
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// API returned an error
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    /// Failed to parse response
    #[error("Parse error: {0}")]
    Parse(String),

    /// Private token requested without a request signer
    #[error("Private connection requires a request signer")]
    MissingSigner,
}

impl AuthError {
    /// Build an API error, classifying credential failures
    pub fn from_api(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if CREDENTIAL_ERROR_CODES.contains(&code.as_str()) {
            Self::InvalidCredentials(format!("{} ({})", message, code))
        } else {
            Self::Api { code, message }
        }
    }

    /// Returns true if retrying with the same credentials cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidCredentials(_) | Self::MissingSigner)
    }
}

impl From<AuthError> for StreamError {
    fn from(err: AuthError) -> Self {
        if err.is_permanent() {
            StreamError::Auth(err.to_string())
        } else {
            StreamError::TokenFetch(err.to_string())
        }
    }
}

/// Result type for token operations
pub type AuthResult<T> = Result<T, AuthError>;
