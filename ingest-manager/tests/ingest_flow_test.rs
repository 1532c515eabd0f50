//! End-to-end ingestion: stored credentials through a scheduler pass against
//! a mock upstream, down to the persisted ingestion watermark.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use ingest_manager::email::GmailClient;
use ingest_manager::failure::RetryBudgets;
use ingest_manager::retry::RetryPolicy;
use ingest_manager::scheduler::IngestScheduler;
use ingest_manager::source::DataSource;
use keeper::config::EmailProviderConfig;
use keeper::{CredentialStore, DataSourceCredentials, DataSourceType, EmailCredentials};
use mockito::Server;

fn make_store() -> Arc<CredentialStore> {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("credentials.db");
    let key = BASE64.encode([7u8; 32]);
    let store = CredentialStore::new(&path, &key).expect("Failed to create store");
    // Leak the tempdir so the database outlives this helper
    std::mem::forget(dir);
    Arc::new(store)
}

fn seed_email_user(store: &CredentialStore, user: &str, token: &str, expires_in_secs: i64) {
    store
        .store(
            user,
            "email",
            &DataSourceCredentials::Email(EmailCredentials {
                access_token: token.to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            }),
        )
        .unwrap();
}

fn gmail_client(store: Arc<CredentialStore>, server_url: &str) -> GmailClient {
    GmailClient::with_endpoints(
        store,
        EmailProviderConfig {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
            redirect_uri: "http://localhost:3000/api/sources/email/auth/callback".to_string(),
        },
        server_url.to_string(),
        format!("{}/token", server_url),
        RetryBudgets {
            rate_limited: RetryPolicy::new(2, 5),
            network: RetryPolicy::new(1, 5),
        },
    )
}

#[tokio::test]
async fn scheduler_pass_ingests_and_isolates_failures() {
    let mut server = Server::new_async().await;

    // u1 fetches an empty mailbox successfully
    let _list_ok = server
        .mock("GET", "/gmail/v1/users/me/messages?maxResults=25")
        .match_header("authorization", "Bearer u1_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages":[]}"#)
        .create_async()
        .await;

    // u2's token is rejected, and so is the refresh attempt
    let _list_rejected = server
        .mock("GET", "/gmail/v1/users/me/messages?maxResults=25")
        .match_header("authorization", "Bearer u2_token")
        .with_status(401)
        .with_body(r#"{"error":{"code":401}}"#)
        .create_async()
        .await;
    let _refresh_rejected = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let store = make_store();
    seed_email_user(&store, "u1", "u1_token", 3600);
    seed_email_user(&store, "u2", "u2_token", 3600);

    let gmail: Arc<dyn DataSource> = Arc::new(gmail_client(Arc::clone(&store), &server.url()));
    let scheduler = IngestScheduler::new(Arc::clone(&store), vec![gmail]);

    let report = scheduler.run_now().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.auth_expired, 1);
    assert_eq!(report.failed, 0);

    // u1's watermark moved, u2's did not
    let u1 = store.record("u1", DataSourceType::Email).unwrap().unwrap();
    assert!(u1.last_ingested_at.is_some());
    let u2 = store.record("u2", DataSourceType::Email).unwrap().unwrap();
    assert!(u2.last_ingested_at.is_none());
}

#[tokio::test]
async fn proactive_refresh_flows_through_a_full_fetch() {
    let mut server = Server::new_async().await;

    let refresh = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"fresh_token","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let list = server
        .mock("GET", "/gmail/v1/users/me/messages?maxResults=25")
        .match_header("authorization", "Bearer fresh_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages":[]}"#)
        .create_async()
        .await;

    let store = make_store();
    // 60 seconds left, inside the proactive-refresh margin
    seed_email_user(&store, "u1", "old_token", 60);

    let client = gmail_client(Arc::clone(&store), &server.url());
    let snapshot = client.fetch_mailbox("u1").await.unwrap();
    assert!(snapshot.messages.is_empty());

    refresh.assert_async().await;
    list.assert_async().await;

    // The refreshed token was persisted for the next pass
    let persisted = store
        .get("u1", DataSourceType::Email)
        .unwrap()
        .unwrap()
        .into_email()
        .unwrap();
    assert_eq!(persisted.access_token, "fresh_token");
    assert_eq!(persisted.refresh_token, "refresh");
}
