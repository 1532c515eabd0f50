//! Ephemeral OAuth state token carried through the authorization redirect.
//!
//! The token is a base64-encoded JSON object and is never stored server
//! side: the callback accepts any token that decodes and passes field
//! validation. It is opaque, not signed — a well-formed forged token would
//! be accepted, which is a recorded design trade-off, not an oversight.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credentials::DataSourceType;
use crate::error::{Error, Result};

/// State round-tripped through the OAuth authorization redirect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub user_id: String,

    /// Data source tag (must parse as a known [`DataSourceType`])
    pub source: String,

    /// Random single-use nonce
    pub nonce: String,

    /// Whether the flow was started from a popup window (the callback picks
    /// the matching status page)
    #[serde(default)]
    pub popup: bool,
}

impl AuthState {
    pub fn new(user_id: &str, source: DataSourceType, popup: bool) -> Self {
        Self {
            user_id: user_id.to_string(),
            source: source.as_str().to_string(),
            nonce: Uuid::new_v4().to_string(),
            popup,
        }
    }

    /// Encodes the state as an opaque base64 token.
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and a bool cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        BASE64.encode(json)
    }

    /// Decodes and validates a state token from a callback.
    ///
    /// # Errors
    /// `Error::Validation` when the token is not base64, not JSON, missing a
    /// required field, names an unknown source tag, or has an empty user id.
    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(raw)
            .map_err(|_| Error::Validation("state token is not valid base64".to_string()))?;
        let state: AuthState = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("state token is malformed: {}", e)))?;

        if state.user_id.is_empty() {
            return Err(Error::Validation(
                "state token has an empty user id".to_string(),
            ));
        }
        // Unknown source tags fail here with the same Validation error
        state.source.parse::<DataSourceType>()?;

        Ok(state)
    }

    pub fn source_type(&self) -> Result<DataSourceType> {
        self.source.parse()
    }
}
