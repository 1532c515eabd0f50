//! Aggregation API client: link flow and resilient financial fetch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use keeper::config::FinancialProviderConfig;
use keeper::{
    CredentialStore, DataSourceCredentials, DataSourceType, Error, FinancialCredentials, Result,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::types::{
    AccountsResponse, ExchangeResponse, LinkTokenResponse, ProviderError, RecurringResponse,
    TransactionsResponse,
};
use super::FinancialSnapshot;
use crate::failure::{run_with_budgets, ApiFailure, FailureKind, RetryBudgets};
use crate::source::{DataSource, FetchOutcome};

/// How far back the transaction fetch reaches.
const TRANSACTION_WINDOW_DAYS: i64 = 30;

/// Transactions requested per fetch.
const TRANSACTION_COUNT: usize = 100;

/// What a caller holds after asking for financial access: either the item is
/// linked and fetchable, or the frontend must run the link widget with a
/// fresh link token.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinancialAccess {
    Linked { item_id: Option<String> },
    LinkRequired { link_token: String },
}

/// Aggregation API client bound to the credential store.
///
/// Unlike the email client there is no token refresh path: the provider's
/// access tokens live until revoked, and revocation is only recoverable by
/// the end user re-linking through the widget.
pub struct PlaidClient {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    config: FinancialProviderConfig,
    budgets: RetryBudgets,
}

impl PlaidClient {
    pub fn new(store: Arc<CredentialStore>, config: FinancialProviderConfig) -> Self {
        Self::with_budgets(store, config, RetryBudgets::default())
    }

    pub fn with_budgets(
        store: Arc<CredentialStore>,
        config: FinancialProviderConfig,
        budgets: RetryBudgets,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            config,
            budgets,
        }
    }

    /// Returns linked access when the stored item is usable, otherwise a
    /// fresh link token for the frontend widget.
    ///
    /// A stored record that never completed the exchange (no access token)
    /// counts as unlinked and gets a new link token rather than an error.
    pub async fn access_or_link_token(&self, user_id: &str) -> Result<FinancialAccess> {
        match self.store.get(user_id, DataSourceType::Financial)? {
            Some(DataSourceCredentials::Financial(credentials)) if credentials.is_linked() => {
                Ok(FinancialAccess::Linked {
                    item_id: credentials.item_id,
                })
            }
            _ => {
                debug!(user_id = %user_id, "No linked financial item, creating link token");
                let link_token = self.create_link_token(user_id).await?;
                Ok(FinancialAccess::LinkRequired { link_token })
            }
        }
    }

    /// Creates a short-lived link token scoped to this user.
    pub async fn create_link_token(&self, user_id: &str) -> Result<String> {
        let body = json!({
            "client_id": self.config.client_id,
            "secret": self.config.secret,
            "client_name": "Keeper",
            "user": { "client_user_id": user_id },
            "products": ["transactions"],
            "country_codes": ["US"],
            "language": "en",
        });

        let response: LinkTokenResponse = self
            .resilient("creating link token", || {
                self.post_api("/link/token/create", body.clone())
            })
            .await?;

        Ok(response.link_token)
    }

    /// Exchanges the widget's public token for a long-lived access token and
    /// persists the linked credentials.
    ///
    /// # Errors
    /// `Error::TokenExchange` when the provider rejects the public token.
    pub async fn exchange_public_token(&self, user_id: &str, public_token: &str) -> Result<String> {
        let body = json!({
            "client_id": self.config.client_id,
            "secret": self.config.secret,
            "public_token": public_token,
        });

        let response: ExchangeResponse = self
            .post_api("/item/public_token/exchange", body)
            .await
            .map_err(|failure| {
                Error::TokenExchange(format!("public token exchange failed: {}", failure.message))
            })?;

        self.store.store(
            user_id,
            DataSourceType::Financial.as_str(),
            &DataSourceCredentials::Financial(FinancialCredentials {
                access_token: Some(response.access_token),
                item_id: Some(response.item_id.clone()),
            }),
        )?;

        info!(user_id = %user_id, item_id = %response.item_id, "Financial item linked");
        Ok(response.item_id)
    }

    /// Fetches accounts, recent transactions, and recurring payment streams
    /// for one user.
    ///
    /// Each sub-fetch carries its own retry budget and error label, so a
    /// failure names the stage it died in.
    pub async fn fetch_finances(&self, user_id: &str) -> Result<FinancialSnapshot> {
        let access_token = self.access_token(user_id)?;

        let accounts: AccountsResponse = self
            .resilient("fetching accounts", || {
                self.post_api(
                    "/accounts/get",
                    json!({
                        "client_id": self.config.client_id,
                        "secret": self.config.secret,
                        "access_token": access_token,
                    }),
                )
            })
            .await?;

        let end_date = Utc::now().date_naive();
        let start_date = end_date - Duration::days(TRANSACTION_WINDOW_DAYS);
        let transactions: TransactionsResponse = self
            .resilient("fetching transactions", || {
                self.post_api(
                    "/transactions/get",
                    json!({
                        "client_id": self.config.client_id,
                        "secret": self.config.secret,
                        "access_token": access_token,
                        "start_date": start_date.to_string(),
                        "end_date": end_date.to_string(),
                        "options": { "count": TRANSACTION_COUNT },
                    }),
                )
            })
            .await?;

        let recurring: RecurringResponse = self
            .resilient("fetching scheduled payments", || {
                self.post_api(
                    "/transactions/recurring/get",
                    json!({
                        "client_id": self.config.client_id,
                        "secret": self.config.secret,
                        "access_token": access_token,
                    }),
                )
            })
            .await?;

        let mut snapshot = FinancialSnapshot {
            accounts: accounts.accounts.into_iter().map(Into::into).collect(),
            transactions: transactions.transactions.into_iter().map(Into::into).collect(),
            scheduled_payments: Vec::new(),
        };
        snapshot.scheduled_payments.extend(
            recurring
                .outflow_streams
                .into_iter()
                .map(|s| s.into_payment(false)),
        );
        snapshot.scheduled_payments.extend(
            recurring
                .inflow_streams
                .into_iter()
                .map(|s| s.into_payment(true)),
        );

        info!(
            user_id = %user_id,
            account_count = snapshot.accounts.len(),
            transaction_count = snapshot.transactions.len(),
            stream_count = snapshot.scheduled_payments.len(),
            "Financial fetch complete"
        );

        Ok(snapshot)
    }

    fn access_token(&self, user_id: &str) -> Result<String> {
        let credentials = self
            .store
            .get(user_id, DataSourceType::Financial)?
            .and_then(DataSourceCredentials::into_financial)
            .ok_or_else(|| {
                Error::NotFound(format!("no financial credentials for user '{}'", user_id))
            })?;

        credentials
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::AuthExpired(
                    "financial item requires re-link: stored record has no access token"
                        .to_string(),
                )
            })
    }

    /// Runs a provider call under the retry budgets. Auth failures are never
    /// retried here; they surface as a re-link requirement.
    async fn resilient<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ApiFailure>>,
    {
        run_with_budgets(self.budgets, op).await.map_err(|failure| {
            if failure.kind == FailureKind::AuthExpired {
                Error::AuthExpired(format!(
                    "financial item requires re-link: {}",
                    failure.message
                ))
            } else {
                failure.into_error(operation)
            }
        })
    }

    /// POST with the provider's JSON envelope, classifying failures by the
    /// error body when one is present.
    async fn post_api<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> std::result::Result<T, ApiFailure> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiFailure::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_provider_error(status.as_u16(), &text));
        }

        response.json::<T>().await.map_err(|e| {
            ApiFailure::new(
                FailureKind::Other,
                format!("failed to parse response: {}", e),
                Some(status.as_u16()),
            )
        })
    }
}

/// Maps the provider's error envelope onto a failure class, falling back to
/// the HTTP status when the body is not the expected shape.
fn classify_provider_error(status: u16, body: &str) -> ApiFailure {
    let Ok(error) = serde_json::from_str::<ProviderError>(body) else {
        return ApiFailure::from_status(status, body);
    };

    let message = if error.error_message.is_empty() {
        format!("{} ({})", error.error_type, error.error_code)
    } else {
        error.error_message.clone()
    };

    let kind = match (error.error_type.as_str(), error.error_code.as_str()) {
        ("RATE_LIMIT_EXCEEDED", _) => FailureKind::RateLimited,
        (_, "ITEM_LOGIN_REQUIRED") | (_, "INVALID_ACCESS_TOKEN") => FailureKind::AuthExpired,
        _ => return ApiFailure::from_status(status, message),
    };

    ApiFailure::new(kind, message, Some(status))
}

#[async_trait]
impl DataSource for PlaidClient {
    fn source_type(&self) -> DataSourceType {
        DataSourceType::Financial
    }

    async fn fetch(&self, user_id: &str) -> Result<FetchOutcome> {
        Ok(FetchOutcome::Financial(self.fetch_finances(user_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use mockito::{Matcher, Server};

    fn make_store() -> Arc<CredentialStore> {
        let key = BASE64.encode([0u8; 32]);
        Arc::new(CredentialStore::new(":memory:", &key).expect("Failed to create test store"))
    }

    fn make_client(store: Arc<CredentialStore>, base_url: &str) -> PlaidClient {
        PlaidClient::with_budgets(
            store,
            FinancialProviderConfig {
                client_id: "test_client_id".to_string(),
                secret: "test_secret".to_string(),
                base_url: base_url.to_string(),
            },
            RetryBudgets {
                rate_limited: RetryPolicy::new(2, 5),
                network: RetryPolicy::new(1, 5),
            },
        )
    }

    fn store_linked(store: &CredentialStore, user: &str, token: &str) {
        store
            .store(
                user,
                "financial",
                &DataSourceCredentials::Financial(FinancialCredentials {
                    access_token: Some(token.to_string()),
                    item_id: Some("item1".to_string()),
                }),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_link_token_request_shape() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/link/token/create")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({"client_id": "test_client_id"})),
                Matcher::PartialJson(json!({"user": {"client_user_id": "u1"}})),
                Matcher::PartialJson(json!({"products": ["transactions"]})),
                Matcher::PartialJson(json!({"country_codes": ["US"]})),
                Matcher::PartialJson(json!({"language": "en"})),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"link_token":"link-sandbox-abc"}"#)
            .create_async()
            .await;

        let client = make_client(make_store(), &server.url());
        let token = client.create_link_token("u1").await.unwrap();

        assert_eq!(token, "link-sandbox-abc");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_access_or_link_token_when_linked() {
        let server = Server::new_async().await;
        let store = make_store();
        store_linked(&store, "u1", "access-token-1");

        // No link-token mock: any HTTP call here would fail the test
        let client = make_client(store, &server.url());
        let access = client.access_or_link_token("u1").await.unwrap();

        assert!(matches!(
            access,
            FinancialAccess::Linked { item_id: Some(ref id) } if id == "item1"
        ));
    }

    #[tokio::test]
    async fn test_access_or_link_token_for_new_user() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/link/token/create")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"link_token":"link-sandbox-new"}"#)
            .create_async()
            .await;

        let client = make_client(make_store(), &server.url());
        let access = client.access_or_link_token("u1").await.unwrap();

        assert!(matches!(
            access,
            FinancialAccess::LinkRequired { ref link_token } if link_token == "link-sandbox-new"
        ));
    }

    #[tokio::test]
    async fn test_half_linked_record_gets_fresh_link_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/link/token/create")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"link_token":"link-sandbox-again"}"#)
            .create_async()
            .await;

        let store = make_store();
        store
            .store(
                "u1",
                "financial",
                &DataSourceCredentials::Financial(FinancialCredentials {
                    access_token: None,
                    item_id: None,
                }),
            )
            .unwrap();

        let client = make_client(store, &server.url());
        let access = client.access_or_link_token("u1").await.unwrap();
        assert!(matches!(access, FinancialAccess::LinkRequired { .. }));
    }

    #[tokio::test]
    async fn test_exchange_public_token_persists_credentials() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/item/public_token/exchange")
            .match_body(Matcher::PartialJson(json!({"public_token": "public-abc"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"access-xyz","item_id":"item-42"}"#)
            .create_async()
            .await;

        let store = make_store();
        let client = make_client(Arc::clone(&store), &server.url());

        let item_id = client.exchange_public_token("u1", "public-abc").await.unwrap();
        assert_eq!(item_id, "item-42");

        let persisted = store
            .get("u1", DataSourceType::Financial)
            .unwrap()
            .unwrap()
            .into_financial()
            .unwrap();
        assert_eq!(persisted.access_token.as_deref(), Some("access-xyz"));
        assert_eq!(persisted.item_id.as_deref(), Some("item-42"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_rejection_is_token_exchange_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/item/public_token/exchange")
            .with_status(400)
            .with_body(
                r#"{"error_type":"INVALID_INPUT","error_code":"INVALID_PUBLIC_TOKEN","error_message":"provided public token is invalid"}"#,
            )
            .create_async()
            .await;

        let client = make_client(make_store(), &server.url());
        let err = client
            .exchange_public_token("u1", "stale-public")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TokenExchange(_)));
        assert!(err.to_string().contains("public token is invalid"));
    }

    #[tokio::test]
    async fn test_fetch_finances_happy_path() {
        let mut server = Server::new_async().await;

        let _accounts = server
            .mock("POST", "/accounts/get")
            .match_body(Matcher::PartialJson(json!({"access_token": "access-token-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"accounts":[{
                    "account_id": "acc1",
                    "name": "Checking",
                    "type": "depository",
                    "subtype": "checking",
                    "balances": {"available": 250.0, "current": 300.0, "iso_currency_code": "USD"}
                }]}"#,
            )
            .create_async()
            .await;

        let _transactions = server
            .mock("POST", "/transactions/get")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"transactions":[{
                    "transaction_id": "t1",
                    "account_id": "acc1",
                    "amount": 42.0,
                    "date": "2026-08-15",
                    "name": "Grocery Store",
                    "pending": false,
                    "category": ["Shops", "Supermarkets"]
                }]}"#,
            )
            .create_async()
            .await;

        let _recurring = server
            .mock("POST", "/transactions/recurring/get")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "outflow_streams": [{
                        "stream_id": "s1",
                        "account_id": "acc1",
                        "description": "Rent",
                        "average_amount": {"amount": 1500.0},
                        "frequency": "MONTHLY",
                        "predicted_next_date": "2026-09-01"
                    }],
                    "inflow_streams": [{
                        "stream_id": "s2",
                        "account_id": "acc1",
                        "description": "Payroll",
                        "average_amount": {"amount": 3000.0},
                        "frequency": "BIWEEKLY"
                    }]
                }"#,
            )
            .create_async()
            .await;

        let store = make_store();
        store_linked(&store, "u1", "access-token-1");

        let client = make_client(store, &server.url());
        let snapshot = client.fetch_finances("u1").await.unwrap();

        assert_eq!(snapshot.accounts.len(), 1);
        assert_eq!(snapshot.transactions.len(), 1);
        assert_eq!(snapshot.transactions[0].category.as_deref(), Some("Supermarkets"));
        assert_eq!(snapshot.scheduled_payments.len(), 2);
        assert!(!snapshot.scheduled_payments[0].inbound);
        assert!(snapshot.scheduled_payments[1].inbound);
    }

    #[tokio::test]
    async fn test_fetch_without_credentials_is_not_found() {
        let server = Server::new_async().await;
        let client = make_client(make_store(), &server.url());

        let err = client.fetch_finances("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_on_accounts_names_the_stage() {
        let mut server = Server::new_async().await;
        let accounts = server
            .mock("POST", "/accounts/get")
            .with_status(429)
            .with_body(
                r#"{"error_type":"RATE_LIMIT_EXCEEDED","error_code":"TRANSACTIONS_LIMIT","error_message":"rate limit exceeded"}"#,
            )
            .expect(3)
            .create_async()
            .await;

        let store = make_store();
        store_linked(&store, "u1", "access-token-1");

        let client = make_client(store, &server.url());
        let err = client.fetch_finances("u1").await.unwrap_err();

        assert!(err
            .to_string()
            .contains("Rate limit exceeded when fetching accounts"));
        accounts.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_required_surfaces_relink_without_retry() {
        let mut server = Server::new_async().await;
        let accounts = server
            .mock("POST", "/accounts/get")
            .with_status(400)
            .with_body(
                r#"{"error_type":"ITEM_ERROR","error_code":"ITEM_LOGIN_REQUIRED","error_message":"the login details of this item have changed"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let store = make_store();
        store_linked(&store, "u1", "access-token-1");

        let client = make_client(store, &server.url());
        let err = client.fetch_finances("u1").await.unwrap_err();

        assert!(matches!(err, Error::AuthExpired(_)));
        assert!(err.to_string().contains("financial item requires re-link"));
        accounts.assert_async().await;
    }
}
