//! Gmail client: OAuth lifecycle and resilient mailbox fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use keeper::config::EmailProviderConfig;
use keeper::{
    CredentialStore, DataSourceCredentials, DataSourceType, EmailCredentials, Error, Result,
};
use serde::Deserialize;
use tracing::{debug, info};

use super::message::{normalize_message, MessageListPage, RawMessage};
use super::{MailboxSnapshot, API_BASE, AUTH_URL, SCOPE, TOKEN_URL};
use crate::failure::{run_with_budgets, ApiFailure, FailureKind, RetryBudgets};
use crate::source::{DataSource, FetchOutcome};

/// Hard cap on messages fetched per pass.
const MAX_MESSAGES: usize = 100;

/// Page size for the list endpoint.
const PAGE_SIZE: usize = 25;

/// Access tokens within this margin of expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Token endpoint response for the authorization-code grant.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Gmail API client bound to the credential store.
///
/// All token state lives in the store; the client itself is stateless and
/// can be shared across tasks.
pub struct GmailClient {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    config: EmailProviderConfig,
    api_base: String,
    token_url: String,
    budgets: RetryBudgets,
}

impl GmailClient {
    pub fn new(store: Arc<CredentialStore>, config: EmailProviderConfig) -> Self {
        Self::with_endpoints(
            store,
            config,
            API_BASE.to_string(),
            TOKEN_URL.to_string(),
            RetryBudgets::default(),
        )
    }

    /// Creates a client with custom endpoints and budgets (for testing with
    /// a mock server).
    pub fn with_endpoints(
        store: Arc<CredentialStore>,
        config: EmailProviderConfig,
        api_base: String,
        token_url: String,
        budgets: RetryBudgets,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            config,
            api_base,
            token_url,
            budgets,
        }
    }

    /// Builds the authorization-code-grant URL.
    ///
    /// `access_type=offline` plus `prompt=consent` forces the provider to
    /// issue a refresh token even on repeat authorizations.
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            AUTH_URL,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(SCOPE),
            urlencoding::encode(state)
        )
    }

    /// Exchanges an authorization code for a full credential set.
    ///
    /// # Errors
    /// `Error::TokenExchange` when the endpoint rejects the code or the
    /// response omits any of access token, refresh token, or expiry — the
    /// provider is not trusted to always return all three.
    pub async fn exchange_code(&self, code: &str) -> Result<EmailCredentials> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", self.config.redirect_uri.as_str());
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::TokenExchange(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchange(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenExchange(format!("unparseable token response: {}", e)))?;

        let access_token = require_token_field(token.access_token, "access_token")?;
        let refresh_token = require_token_field(token.refresh_token, "refresh_token")?;
        let expires_in = token
            .expires_in
            .ok_or_else(|| Error::TokenExchange("token response missing expires_in".to_string()))?;

        Ok(EmailCredentials {
            access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }

    /// Returns a usable access token for the user, refreshing proactively
    /// when fewer than five minutes of lifetime remain.
    ///
    /// # Errors
    /// `Error::NotFound` when the user has no stored email credentials.
    pub async fn access_token(&self, user_id: &str) -> Result<String> {
        let credentials = self.load_credentials(user_id)?;

        let margin = Utc::now() + Duration::seconds(REFRESH_MARGIN_SECS);
        if credentials.expires_at <= margin {
            let refreshed = self.refresh_access_token(user_id, &credentials).await?;
            return Ok(refreshed.access_token);
        }

        Ok(credentials.access_token)
    }

    /// Fetches up to [`MAX_MESSAGES`] messages, newest first, normalizing
    /// each and deriving the contact set.
    ///
    /// Pages are walked sequentially; the full content of each message in a
    /// page is fetched concurrently.
    pub async fn fetch_mailbox(&self, user_id: &str) -> Result<MailboxSnapshot> {
        let mut snapshot = MailboxSnapshot::default();
        let mut page_token: Option<String> = None;

        loop {
            let page_size = (MAX_MESSAGES - snapshot.messages.len()).min(PAGE_SIZE);
            let mut list_url = format!(
                "{}/gmail/v1/users/me/messages?maxResults={}",
                self.api_base, page_size
            );
            if let Some(token) = &page_token {
                list_url.push_str("&pageToken=");
                list_url.push_str(&urlencoding::encode(token));
            }

            let page: MessageListPage = self
                .resilient(user_id, "listing messages", |access| {
                    let http = self.http.clone();
                    let url = list_url.clone();
                    async move { get_json(&http, &url, &access).await }
                })
                .await?;

            let fetches = page.messages.iter().map(|message_ref| {
                let url = format!(
                    "{}/gmail/v1/users/me/messages/{}?format=full",
                    self.api_base, message_ref.id
                );
                self.resilient(user_id, "fetching message content", move |access| {
                    let http = self.http.clone();
                    let url = url.clone();
                    async move { get_json::<RawMessage>(&http, &url, &access).await }
                })
            });

            for raw in futures::future::join_all(fetches).await {
                let message = normalize_message(&raw?);
                if !message.sender.is_empty() {
                    snapshot.contacts.insert(message.sender.clone());
                }
                snapshot.contacts.extend(message.recipients.iter().cloned());
                snapshot.messages.push(message);
                if snapshot.messages.len() >= MAX_MESSAGES {
                    break;
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() || snapshot.messages.len() >= MAX_MESSAGES {
                break;
            }
        }

        info!(
            user_id = %user_id,
            message_count = snapshot.messages.len(),
            contact_count = snapshot.contacts.len(),
            "Mailbox fetch complete"
        );

        Ok(snapshot)
    }

    fn load_credentials(&self, user_id: &str) -> Result<EmailCredentials> {
        self.store
            .get(user_id, DataSourceType::Email)?
            .and_then(DataSourceCredentials::into_email)
            .ok_or_else(|| Error::NotFound(format!("no email credentials for user '{}'", user_id)))
    }

    /// Refreshes the access token and re-persists the credential record,
    /// keeping the old refresh token when the provider does not rotate it.
    async fn refresh_access_token(
        &self,
        user_id: &str,
        current: &EmailCredentials,
    ) -> Result<EmailCredentials> {
        debug!(user_id = %user_id, "Refreshing email access token");

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", current.refresh_token.as_str());
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::AuthExpired(format!("token refresh request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthExpired(format!(
                "token refresh failed with status {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::AuthExpired(format!("unparseable refresh response: {}", e)))?;

        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::AuthExpired("refresh response missing access_token".to_string()))?;
        let refresh_token = token
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| current.refresh_token.clone());
        let expires_at = Utc::now() + Duration::seconds(token.expires_in.unwrap_or(3600));

        let updated = EmailCredentials {
            access_token,
            refresh_token,
            expires_at,
        };
        self.store.store(
            user_id,
            DataSourceType::Email.as_str(),
            &DataSourceCredentials::Email(updated.clone()),
        )?;

        info!(user_id = %user_id, "Email access token refreshed");
        Ok(updated)
    }

    /// Runs an API operation with classified retries.
    ///
    /// Rate-limit and network failures retry under this client's budgets.
    /// An auth failure triggers one forced token refresh followed by a
    /// single bare retry that does not count against any budget.
    async fn resilient<T, F, Fut>(&self, user_id: &str, operation: &str, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiFailure>>,
    {
        let token = self.access_token(user_id).await?;
        let result = run_with_budgets(self.budgets, || op(token.clone())).await;

        match result {
            Ok(value) => Ok(value),
            Err(failure) if failure.kind == FailureKind::AuthExpired => {
                debug!(
                    user_id = %user_id,
                    operation = %operation,
                    "Access token rejected upstream, refreshing and retrying once"
                );
                let current = self.load_credentials(user_id)?;
                let refreshed = self.refresh_access_token(user_id, &current).await?;
                op(refreshed.access_token)
                    .await
                    .map_err(|failure| failure.into_error(operation))
            }
            Err(failure) => Err(failure.into_error(operation)),
        }
    }
}

#[async_trait]
impl DataSource for GmailClient {
    fn source_type(&self) -> DataSourceType {
        DataSourceType::Email
    }

    async fn fetch(&self, user_id: &str) -> Result<FetchOutcome> {
        Ok(FetchOutcome::Mailbox(self.fetch_mailbox(user_id).await?))
    }
}

fn require_token_field(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::TokenExchange(format!("token response missing {}", field)))
}

/// GET with bearer auth, classifying transport and status failures.
async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> std::result::Result<T, ApiFailure> {
    let response = http
        .get(url)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| ApiFailure::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiFailure::from_status(status.as_u16(), body));
    }

    response.json::<T>().await.map_err(|e| {
        ApiFailure::new(
            FailureKind::Other,
            format!("failed to parse response: {}", e),
            Some(status.as_u16()),
        )
    })
}
