//! Push endpoint URL construction

use kucoin_types::{ConnectionToken, InstanceServer, StreamError, StreamResult};
use url::Url;

/// Build the URL for connecting to `server` with the given token
///
/// Private connections additionally ask the server to push user messages.
pub fn connect_url(
    server: &InstanceServer,
    token: &str,
    connect_id: &str,
    private: bool,
) -> StreamResult<String> {
    let mut url = Url::parse(&server.endpoint).map_err(|e| {
        StreamError::Transport(format!("invalid endpoint {}: {}", server.endpoint, e))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("token", token);
        query.append_pair("connectId", connect_id);
        if private {
            query.append_pair("acceptUserMessage", "true");
        }
    }

    Ok(url.into())
}

/// Pick the endpoint for `attempt` and build its connect URL
pub fn select(
    token: &ConnectionToken,
    attempt: usize,
    private: bool,
) -> StreamResult<(InstanceServer, String)> {
    let server = token
        .endpoint(attempt)
        .ok_or_else(|| StreamError::TokenFetch("token carries no endpoints".to_string()))?
        .clone();
    let url = connect_url(&server, &token.token, &token.connect_id, private)?;
    Ok((server, url))
}

/// Hide the bearer token in a connect URL before it is logged
pub fn redact(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return "<invalid url>".to_string();
    };

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();

    if pairs.is_empty() {
        return parsed.into();
    }

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.into()
}
