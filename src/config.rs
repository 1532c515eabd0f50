//! Environment-based configuration.
//!
//! Everything the service needs is read from `KEEPER_*` variables once at
//! startup. Provider client ids and secrets are required only when the
//! matching integration is actually used; the constructor loads them eagerly
//! so misconfiguration fails at boot rather than mid-flow.

use anyhow::Context;

use crate::error::{Error, Result};

/// OAuth settings for the email provider.
#[derive(Clone, Debug)]
pub struct EmailProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Callback URL registered with the provider
    pub redirect_uri: String,
}

/// API settings for the financial aggregation provider.
#[derive(Clone, Debug)]
pub struct FinancialProviderConfig {
    pub client_id: String,
    pub secret: String,
    /// Provider environment base URL (sandbox by default)
    pub base_url: String,
}

/// Ingestion scheduler settings.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Restricted cron expression `"MIN HOUR * * *"`; None means the default
    /// daily run at 02:00 UTC
    pub schedule: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: None,
        }
    }
}

/// Complete service configuration.
#[derive(Clone, Debug)]
pub struct KeeperConfig {
    pub database_path: String,
    /// Base64-encoded 32-byte master key
    pub encryption_key: String,
    pub api_port: u16,
    /// Public base URL of this service (status-page redirects)
    pub public_url: String,
    pub email: EmailProviderConfig,
    pub financial: FinancialProviderConfig,
    pub scheduler: SchedulerConfig,
}

const DEFAULT_FINANCIAL_BASE_URL: &str = "https://sandbox.plaid.com";

impl KeeperConfig {
    /// Loads configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let database_path =
            std::env::var("KEEPER_CREDENTIALS_DB").unwrap_or_else(|_| "credentials.db".to_string());

        let encryption_key = std::env::var("KEEPER_ENCRYPTION_KEY")
            .context("KEEPER_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

        let api_port: u16 = std::env::var("KEEPER_API_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| Error::Validation("KEEPER_API_PORT must be a valid port".to_string()))?;

        let public_url = std::env::var("KEEPER_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", api_port));

        let email = EmailProviderConfig {
            client_id: std::env::var("KEEPER_GMAIL_CLIENT_ID")
                .context("KEEPER_GMAIL_CLIENT_ID is required")?,
            client_secret: std::env::var("KEEPER_GMAIL_CLIENT_SECRET")
                .context("KEEPER_GMAIL_CLIENT_SECRET is required")?,
            redirect_uri: std::env::var("KEEPER_GMAIL_REDIRECT_URI").unwrap_or_else(|_| {
                format!("{}/api/sources/email/auth/callback", public_url)
            }),
        };

        let financial = FinancialProviderConfig {
            client_id: std::env::var("KEEPER_PLAID_CLIENT_ID")
                .context("KEEPER_PLAID_CLIENT_ID is required")?,
            secret: std::env::var("KEEPER_PLAID_SECRET")
                .context("KEEPER_PLAID_SECRET is required")?,
            base_url: std::env::var("KEEPER_PLAID_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_FINANCIAL_BASE_URL.to_string()),
        };

        let scheduler = SchedulerConfig {
            enabled: std::env::var("KEEPER_INGEST_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            schedule: std::env::var("KEEPER_INGEST_SCHEDULE").ok(),
        };

        Ok(Self {
            database_path,
            encryption_key,
            api_port,
            public_url,
            email,
            financial,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test so parallel test threads never race on the process env
    #[test]
    fn test_from_env() {
        let vars = [
            ("KEEPER_ENCRYPTION_KEY", "a-key"),
            ("KEEPER_GMAIL_CLIENT_ID", "gid"),
            ("KEEPER_GMAIL_CLIENT_SECRET", "gsecret"),
            ("KEEPER_PLAID_CLIENT_ID", "pid"),
            ("KEEPER_PLAID_SECRET", "psecret"),
            ("KEEPER_INGEST_ENABLED", "false"),
            ("KEEPER_INGEST_SCHEDULE", "30 4 * * *"),
        ];
        for (k, v) in vars {
            std::env::set_var(k, v);
        }

        let config = KeeperConfig::from_env().unwrap();
        assert_eq!(config.database_path, "credentials.db");
        assert_eq!(config.api_port, 3000);
        assert_eq!(config.email.client_id, "gid");
        assert_eq!(
            config.email.redirect_uri,
            "http://localhost:3000/api/sources/email/auth/callback"
        );
        assert_eq!(config.financial.base_url, DEFAULT_FINANCIAL_BASE_URL);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.scheduler.schedule.as_deref(), Some("30 4 * * *"));

        for (k, _) in vars {
            std::env::remove_var(k);
        }
    }
}
