//! Error taxonomy shared by the credential store and the ingestion layer.
//!
//! Public operations return one of the closed variants below so callers can
//! map failures to behavior (HTTP status, retry, re-auth). Internals keep
//! using `anyhow::Context`; those errors surface through `Error::Internal`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input: unknown data source tag, malformed state token, invalid
    /// configuration value.
    #[error("validation error: {0}")]
    Validation(String),

    /// No stored credentials for the requested (user, source) pair.
    #[error("not found: {0}")]
    NotFound(String),

    /// The OAuth code exchange returned an incomplete token response.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// Authentication with the upstream provider expired and could not be
    /// recovered; the end user has to re-authorize.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// Terminal upstream failure after any applicable retries.
    #[error("provider API error: {message}")]
    ProviderApi {
        message: String,
        /// Upstream HTTP status, when the failure came from a response.
        status: Option<u16>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn provider_api(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::ProviderApi {
            message: message.into(),
            status,
        }
    }

    /// Upstream HTTP status for provider failures, if known.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::ProviderApi { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_api_display_and_status() {
        let err = Error::provider_api("Rate limit exceeded when fetching accounts", Some(429));
        assert_eq!(
            err.to_string(),
            "provider API error: Rate limit exceeded when fetching accounts"
        );
        assert_eq!(err.upstream_status(), Some(429));
        assert_eq!(Error::NotFound("x".into()).upstream_status(), None);
    }
}
