//! Personal data store core: encrypted credential storage, the data-source
//! model shared with the ingestion layer, and the ephemeral OAuth state token.

pub mod config;
pub mod credentials;
pub mod error;
pub mod oauth_state;

pub use credentials::{
    CredentialStore, DataSourceCredentials, DataSourceType, EmailCredentials, FinancialCredentials,
};
pub use error::{Error, Result};
pub use oauth_state::AuthState;
