//! Data source interface for external provider integrations.

use async_trait::async_trait;
use keeper::{DataSourceType, Result};

use crate::email::MailboxSnapshot;
use crate::financial::FinancialSnapshot;

/// Normalized result of one fetch pass for one user.
///
/// Constructed fresh per call and handed to the caller; nothing here is
/// cached.
#[derive(Clone, Debug)]
pub enum FetchOutcome {
    Mailbox(MailboxSnapshot),
    Financial(FinancialSnapshot),
}

impl FetchOutcome {
    /// Total records fetched, for logging.
    pub fn record_count(&self) -> usize {
        match self {
            FetchOutcome::Mailbox(snapshot) => snapshot.messages.len(),
            FetchOutcome::Financial(snapshot) => {
                snapshot.accounts.len()
                    + snapshot.transactions.len()
                    + snapshot.scheduled_payments.len()
            }
        }
    }
}

/// A provider integration the ingestion scheduler can drive.
///
/// Implementations own their OAuth credential lifecycle: `fetch` loads (and
/// refreshes, where the provider supports it) stored credentials through the
/// credential store, so the scheduler never touches tokens.
///
/// # Error Handling
/// - `Error::AuthExpired` → the end user must re-authorize; the scheduler
///   logs it distinctly and moves on
/// - `Error::ProviderApi` → terminal upstream failure after retries
/// - `Error::NotFound` → credentials disappeared between enumeration and fetch
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Which data source this integration serves.
    fn source_type(&self) -> DataSourceType;

    /// Fetches and normalizes this source's data for one user.
    async fn fetch(&self, user_id: &str) -> Result<FetchOutcome>;
}
