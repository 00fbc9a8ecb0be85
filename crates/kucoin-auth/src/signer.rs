//! Request signing hook for private token requests

use crate::error::AuthResult;

/// Produces authentication headers for a REST request
///
/// The bullet-private endpoint needs the usual signed headers
/// (`KC-API-KEY`, `KC-API-SIGN`, `KC-API-TIMESTAMP`, ...). How they are
/// derived is up to the implementor; the provider only attaches them.
pub trait RequestSigner: Send + Sync {
    /// Return the headers to attach for `method path` with the given body
    fn sign(&self, method: &str, path: &str, body: &str) -> AuthResult<Vec<(String, String)>>;
}

/// Signer returning a fixed header set
///
/// Useful for proxies that inject credentials themselves and only need a
/// static routing header, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: Vec<(String, String)>,
}

impl StaticHeaders {
    /// Create an empty header set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl RequestSigner for StaticHeaders {
    fn sign(&self, _method: &str, _path: &str, _body: &str) -> AuthResult<Vec<(String, String)>> {
        Ok(self.headers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_headers() {
        let signer = StaticHeaders::new()
            .header("KC-API-KEY", "key")
            .header("KC-API-KEY-VERSION", "2");
        let headers = signer.sign("POST", "/api/v1/bullet-private", "").unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("KC-API-KEY".to_string(), "key".to_string()));
    }
}
