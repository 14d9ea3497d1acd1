//! Error types and conversions

use thiserror::Error;

/// Sub-kind for authorization flow failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthFlowErrorKind {
    Cancelled,
    StateMismatch,
    Timeout,
    ProviderError,
}

impl std::fmt::Display for OAuthFlowErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OAuthFlowErrorKind::Cancelled => "cancelled",
            OAuthFlowErrorKind::StateMismatch => "state_mismatch",
            OAuthFlowErrorKind::Timeout => "timeout",
            OAuthFlowErrorKind::ProviderError => "provider_error",
        };
        f.write_str(s)
    }
}

/// Sub-kind for token lifecycle failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthTokenErrorKind {
    Expired,
    InvalidGrant,
    RefreshFailed,
}

impl std::fmt::Display for OAuthTokenErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OAuthTokenErrorKind::Expired => "expired",
            OAuthTokenErrorKind::InvalidGrant => "invalid_grant",
            OAuthTokenErrorKind::RefreshFailed => "refresh_failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed")]
    Unauthenticated,

    #[error("access to server denied: {0}")]
    Forbidden(String),

    #[error("tool is disabled: {0}")]
    ToolDisabled(String),

    #[error("server is not running: {0}")]
    ServerNotRunning(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("OAuth configuration error: {0}")]
    OAuthConfiguration(String),

    #[error("OAuth flow failed ({kind}): {message}")]
    OAuthFlow {
        kind: OAuthFlowErrorKind,
        message: String,
    },

    #[error("OAuth token error ({kind}): {message}")]
    OAuthToken {
        kind: OAuthTokenErrorKind,
        message: String,
    },

    #[error("rate limit exceeded, resets at {reset_at}")]
    RateLimited {
        /// Unix milliseconds at which the current window ends
        reset_at: i64,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::Store(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<BrokerError> for String {
    fn from(err: BrokerError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_kind_display() {
        assert_eq!(OAuthFlowErrorKind::StateMismatch.to_string(), "state_mismatch");
        assert_eq!(OAuthFlowErrorKind::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_error_messages() {
        let err = BrokerError::OAuthToken {
            kind: OAuthTokenErrorKind::InvalidGrant,
            message: "grant revoked upstream".to_string(),
        };
        assert!(err.to_string().contains("invalid_grant"));

        let err = BrokerError::RateLimited { reset_at: 1234 };
        assert!(err.to_string().contains("1234"));
    }
}
