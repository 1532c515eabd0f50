//! HTTP API: source linking flows, source listing, and on-demand ingestion.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use keeper::{
    AuthState, CredentialStore, DataSourceCredentials, DataSourceType, Error, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::email::GmailClient;
use crate::financial::{FinancialAccess, PlaidClient};
use crate::scheduler::{IngestReport, IngestScheduler};

/// Shared state for all API handlers.
pub struct AppState {
    pub store: Arc<CredentialStore>,
    pub email: Arc<GmailClient>,
    pub financial: Arc<PlaidClient>,
    pub scheduler: Arc<IngestScheduler>,
    /// Public base URL, used for post-authorization status redirects
    pub public_url: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sources", get(list_sources))
        .route("/api/sources/email/auth/start", get(email_auth_start))
        .route("/api/sources/email/auth/callback", get(email_auth_callback))
        .route("/api/sources/financial/link-token", post(financial_link_token))
        .route("/api/sources/financial/exchange", post(financial_exchange))
        .route("/api/sources/:source", delete(delete_source))
        .route("/api/ingest/run", post(run_ingest))
        .with_state(state)
}

/// Wraps the shared error type with its HTTP mapping.
#[derive(Debug)]
pub struct AppError(pub Error);

impl From<Error> for AppError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AuthExpired(_) => StatusCode::UNAUTHORIZED,
        Error::TokenExchange(_) | Error::ProviderApi { .. } => StatusCode::BAD_GATEWAY,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Internal error serving request: {:#}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct UserParams {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthStartParams {
    pub user_id: String,
    #[serde(default)]
    pub popup: bool,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user denied the consent screen
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub user_id: String,
    pub public_token: String,
}

#[derive(Debug, Serialize)]
pub struct SourceEntry {
    pub source: String,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SourcesResponse {
    pub user_id: String,
    pub sources: Vec<SourceEntry>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "ingest_running": state.scheduler.is_running(),
    }))
}

/// Lists the sources a user has connected, with ingestion watermarks.
async fn list_sources(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserParams>,
) -> std::result::Result<Json<SourcesResponse>, AppError> {
    let mut sources = Vec::new();
    for source in state.store.list_by_user(&params.user_id)? {
        if let Some(record) = state.store.record(&params.user_id, source)? {
            sources.push(SourceEntry {
                source: source.as_str().to_string(),
                last_ingested_at: record.last_ingested_at,
                connected_at: record.created_at,
            });
        }
    }
    Ok(Json(SourcesResponse {
        user_id: params.user_id,
        sources,
    }))
}

/// Begins the email authorization flow: redirects to the provider's consent
/// screen carrying an opaque state token.
async fn email_auth_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthStartParams>,
) -> std::result::Result<Redirect, AppError> {
    if params.user_id.is_empty() {
        return Err(Error::Validation("user_id must not be empty".to_string()).into());
    }

    let auth_state = AuthState::new(&params.user_id, DataSourceType::Email, params.popup);
    let url = state.email.authorization_url(&auth_state.encode());
    info!(user_id = %params.user_id, "Starting email authorization flow");
    Ok(Redirect::to(&url))
}

/// Completes the email authorization flow.
///
/// Always redirects to the status page; failures land on the error variant
/// rather than surfacing an HTTP error to the browser.
async fn email_auth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let popup = params
        .state
        .as_deref()
        .and_then(|raw| AuthState::decode(raw).ok())
        .map(|s| s.popup)
        .unwrap_or(false);

    match complete_email_callback(&state, &params).await {
        Ok(user_id) => {
            info!(user_id = %user_id, "Email source connected");
            Redirect::to(&connected_redirect(&state.public_url, "email", popup, "success"))
        }
        Err(e) => {
            warn!("Email authorization callback failed: {}", e);
            Redirect::to(&connected_redirect(&state.public_url, "email", popup, "error"))
        }
    }
}

async fn complete_email_callback(state: &AppState, params: &CallbackParams) -> Result<String> {
    if let Some(error) = &params.error {
        return Err(Error::TokenExchange(format!(
            "provider returned error '{}'",
            error
        )));
    }

    let raw_state = params
        .state
        .as_deref()
        .ok_or_else(|| Error::Validation("callback missing state parameter".to_string()))?;
    let auth_state = AuthState::decode(raw_state)?;
    if auth_state.source_type()? != DataSourceType::Email {
        return Err(Error::Validation(format!(
            "state token names source '{}', expected 'email'",
            auth_state.source
        )));
    }

    let code = params
        .code
        .as_deref()
        .ok_or_else(|| Error::Validation("callback missing code parameter".to_string()))?;

    let credentials = state.email.exchange_code(code).await?;
    state.store.store(
        &auth_state.user_id,
        DataSourceType::Email.as_str(),
        &DataSourceCredentials::Email(credentials),
    )?;

    Ok(auth_state.user_id)
}

/// Builds the post-authorization status page URL.
fn connected_redirect(public_url: &str, source: &str, popup: bool, status: &str) -> String {
    let page = if popup { "/connected/popup" } else { "/connected" };
    format!("{}{}?source={}&status={}", public_url, page, source, status)
}

/// Returns linked status or a fresh link token for the financial widget.
async fn financial_link_token(
    State(state): State<Arc<AppState>>,
    Json(params): Json<UserParams>,
) -> std::result::Result<Json<FinancialAccess>, AppError> {
    if params.user_id.is_empty() {
        return Err(Error::Validation("user_id must not be empty".to_string()).into());
    }
    let access = state.financial.access_or_link_token(&params.user_id).await?;
    Ok(Json(access))
}

/// Exchanges a widget public token, completing the financial link.
async fn financial_exchange(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ExchangeRequest>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let item_id = state
        .financial
        .exchange_public_token(&params.user_id, &params.public_token)
        .await?;
    info!(user_id = %params.user_id, "Financial source connected");
    Ok(Json(json!({ "status": "linked", "item_id": item_id })))
}

/// Disconnects a source, deleting its stored credentials.
async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    Query(params): Query<UserParams>,
) -> std::result::Result<StatusCode, AppError> {
    let source: DataSourceType = source.parse()?;
    if state.store.delete(&params.user_id, source)? {
        info!(user_id = %params.user_id, source = %source, "Source disconnected");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!(
            "no {} credentials for user '{}'",
            source, params.user_id
        ))
        .into())
    }
}

/// Triggers an immediate ingestion pass.
async fn run_ingest(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<IngestReport>, AppError> {
    let report = state.scheduler.run_now().await?;
    Ok(Json(report))
}
