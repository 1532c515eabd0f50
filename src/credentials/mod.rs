//! Encrypted credential storage for external data sources.
//!
//! Each user can connect one credential set per data source (email,
//! financial). Credentials are serialized to JSON and encrypted at rest with
//! AES-256-GCM before hitting SQLite; the store decrypts transparently on
//! read and enforces upsert semantics on the (user, source) composite key.
//!
//! # Usage
//!
//! ```no_run
//! use keeper::credentials::{
//!     CredentialStore, DataSourceCredentials, DataSourceType, EmailCredentials,
//! };
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> keeper::Result<()> {
//! let key = std::env::var("KEEPER_ENCRYPTION_KEY").map_err(anyhow::Error::from)?;
//! let store = CredentialStore::new("credentials.db", &key)?;
//!
//! let creds = DataSourceCredentials::Email(EmailCredentials {
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: "1//refresh".to_string(),
//!     expires_at: Utc::now() + Duration::hours(1),
//! });
//! store.store("u1", "email", &creds)?;
//!
//! if let Some(creds) = store.get("u1", DataSourceType::Email)? {
//!     println!("connected: {}", creds.source_type());
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

mod encryption;
mod store;

pub use encryption::{open, seal, validate_key, Sealed};
pub use store::{CredentialRecord, CredentialStore};

/// The external data sources a user can connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    Email,
    Financial,
}

impl DataSourceType {
    pub const ALL: [DataSourceType; 2] = [DataSourceType::Email, DataSourceType::Financial];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::Email => "email",
            DataSourceType::Financial => "financial",
        }
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(DataSourceType::Email),
            "financial" => Ok(DataSourceType::Financial),
            other => Err(Error::Validation(format!(
                "unknown data source type '{}'",
                other
            ))),
        }
    }
}

/// Credentials for the email provider (OAuth authorization-code grant).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailCredentials {
    /// OAuth access token (used as a bearer token on API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    pub refresh_token: String,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
}

/// Credentials for the financial aggregation provider.
///
/// Both fields are optional on purpose: a partially written or legacy record
/// must still decode, so the client can detect it and route the user back
/// through the link flow instead of failing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl FinancialCredentials {
    /// True when the record holds a usable access token.
    pub fn is_linked(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Decrypted credential payload, shaped per data source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DataSourceCredentials {
    Email(EmailCredentials),
    Financial(FinancialCredentials),
}

impl DataSourceCredentials {
    pub fn source_type(&self) -> DataSourceType {
        match self {
            DataSourceCredentials::Email(_) => DataSourceType::Email,
            DataSourceCredentials::Financial(_) => DataSourceType::Financial,
        }
    }

    pub fn into_email(self) -> Option<EmailCredentials> {
        match self {
            DataSourceCredentials::Email(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_financial(self) -> Option<FinancialCredentials> {
        match self {
            DataSourceCredentials::Financial(c) => Some(c),
            _ => None,
        }
    }
}
