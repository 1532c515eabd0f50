use anyhow::{Context, Result};
use ingest_manager::api::{router, AppState};
use ingest_manager::email::GmailClient;
use ingest_manager::financial::PlaidClient;
use ingest_manager::scheduler::IngestScheduler;
use ingest_manager::source::DataSource;
use keeper::config::KeeperConfig;
use keeper::CredentialStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_manager=info,keeper=info".into()),
        )
        .init();

    info!("Ingest Manager starting...");

    let config = KeeperConfig::from_env().context("Failed to load configuration")?;
    info!(
        credentials_db = %config.database_path,
        api_port = config.api_port,
        ingest_enabled = config.scheduler.enabled,
        "Configuration loaded"
    );

    // Credential store, shared by both provider clients and the scheduler
    let store = Arc::new(
        CredentialStore::new(&config.database_path, &config.encryption_key)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let email = Arc::new(GmailClient::new(Arc::clone(&store), config.email.clone()));
    let financial = Arc::new(PlaidClient::new(
        Arc::clone(&store),
        config.financial.clone(),
    ));

    let sources: Vec<Arc<dyn DataSource>> = vec![
        Arc::clone(&email) as Arc<dyn DataSource>,
        Arc::clone(&financial) as Arc<dyn DataSource>,
    ];
    let scheduler = Arc::new(IngestScheduler::new(Arc::clone(&store), sources));
    let scheduler_handle = scheduler
        .start(&config.scheduler)
        .context("Failed to start ingestion scheduler")?;
    if scheduler_handle.is_some() {
        info!("Ingestion scheduler started");
    }

    // Start HTTP API server
    let state = Arc::new(AppState {
        store,
        email,
        financial,
        scheduler,
        public_url: config.public_url.clone(),
    });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api_port))
        .await
        .context("Failed to bind API port")?;
    info!(port = config.api_port, "API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    server_handle.abort();
    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    info!("Ingest manager stopped");

    Ok(())
}
