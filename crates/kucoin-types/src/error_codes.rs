//! Error codes carried by push-server error frames

use std::fmt;

/// Error code of an error frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorCode {
    /// 400 - malformed request
    BadRequest,
    /// 401 - token invalid or expired
    Unauthorized,
    /// 403 - connection not allowed for this user
    Forbidden,
    /// 404 - unknown topic
    TopicNotFound,
    /// 429 - too many requests
    TooManyRequests,
    /// 500 - server side failure
    Internal,
    /// 509 - subscription limit reached
    SubscriptionLimit,
    /// Anything else
    Other(i64),
}

impl ServerErrorCode {
    /// Map a numeric code
    pub fn from_code(code: i64) -> Self {
        match code {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::TopicNotFound,
            429 => Self::TooManyRequests,
            500 => Self::Internal,
            509 => Self::SubscriptionLimit,
            other => Self::Other(other),
        }
    }

    /// Numeric value
    pub fn code(&self) -> i64 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::TopicNotFound => 404,
            Self::TooManyRequests => 429,
            Self::Internal => 500,
            Self::SubscriptionLimit => 509,
            Self::Other(code) => *code,
        }
    }

    /// Whether the connection is unusable after this error
    ///
    /// Authentication failures mean the session token is no longer accepted;
    /// the connection is torn down and reopened with a fresh token.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Forbidden)
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
