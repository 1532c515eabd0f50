//! Scheduled ingestion across all registered data sources.
//!
//! One pass walks every source, enumerates the users holding credentials for
//! it, and fetches per user. Failures are isolated per (user, source) pair:
//! one user's expired item never blocks another user's fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use keeper::config::SchedulerConfig;
use keeper::{CredentialStore, Error, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::source::DataSource;

/// Delay before the catch-up pass after startup, giving the rest of the
/// process time to finish binding.
const STARTUP_CATCHUP_SECS: u64 = 5;

/// Default schedule: daily at 02:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";

/// A restricted cron form: `MIN HOUR * * *`, i.e. once daily at a fixed
/// UTC time. The day/month/weekday fields must be `*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DailySchedule {
    minute: u32,
    hour: u32,
}

impl DailySchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Validation(format!(
                "schedule '{}' must have 5 fields",
                expression
            )));
        }
        if fields[2..] != ["*", "*", "*"] {
            return Err(Error::Validation(format!(
                "schedule '{}' is not supported: only daily schedules of the form 'MIN HOUR * * *' are accepted",
                expression
            )));
        }

        let minute: u32 = fields[0]
            .parse()
            .ok()
            .filter(|m| *m < 60)
            .ok_or_else(|| {
                Error::Validation(format!("schedule minute '{}' out of range", fields[0]))
            })?;
        let hour: u32 = fields[1]
            .parse()
            .ok()
            .filter(|h| *h < 24)
            .ok_or_else(|| {
                Error::Validation(format!("schedule hour '{}' out of range", fields[1]))
            })?;

        Ok(Self { minute, hour })
    }

    /// The next trigger time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let candidate = Utc
            .from_utc_datetime(
                &today
                    .and_hms_opt(self.hour, self.minute, 0)
                    .unwrap_or_else(|| today.and_hms_opt(0, 0, 0).unwrap()),
            )
            .with_nanosecond(0)
            .unwrap_or(now);

        if candidate > now {
            candidate
        } else {
            candidate + Duration::days(1)
        }
    }
}

/// Outcome of one ingestion pass.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct IngestReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub auth_expired: usize,
    pub failed: usize,
}

/// Drives scheduled and on-demand ingestion passes.
pub struct IngestScheduler {
    store: Arc<CredentialStore>,
    sources: Vec<Arc<dyn DataSource>>,
    running: AtomicBool,
}

impl IngestScheduler {
    pub fn new(store: Arc<CredentialStore>, sources: Vec<Arc<dyn DataSource>>) -> Self {
        Self {
            store,
            sources,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the background loop: a catch-up pass shortly after startup,
    /// then one pass per schedule trigger.
    ///
    /// Returns `None` when the scheduler is disabled; on-demand passes via
    /// [`run_now`](Self::run_now) still work in that case.
    pub fn start(
        self: &Arc<Self>,
        config: &SchedulerConfig,
    ) -> Result<Option<JoinHandle<()>>> {
        let schedule = DailySchedule::parse(
            config.schedule.as_deref().unwrap_or(DEFAULT_SCHEDULE),
        )?;

        if !config.enabled {
            info!("Ingestion scheduler disabled, passes run on demand only");
            return Ok(None);
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(STARTUP_CATCHUP_SECS)).await;
            info!("Running startup catch-up ingestion pass");
            if let Err(e) = scheduler.run_now().await {
                warn!("Startup ingestion pass skipped: {}", e);
            }

            loop {
                let now = Utc::now();
                let next = schedule.next_after(now);
                let wait = (next - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));
                info!(next_run = %next, "Ingestion scheduler sleeping until next trigger");
                tokio::time::sleep(wait).await;

                if let Err(e) = scheduler.run_now().await {
                    warn!("Scheduled ingestion pass skipped: {}", e);
                }
            }
        });

        Ok(Some(handle))
    }

    /// Runs one full ingestion pass immediately.
    ///
    /// # Errors
    /// `Error::Validation` when a pass is already in flight; per-user fetch
    /// failures never fail the pass, they are counted in the report.
    pub async fn run_now(&self) -> Result<IngestReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Validation(
                "an ingestion pass is already running".to_string(),
            ));
        }

        let report = self.run_pass().await;
        self.running.store(false, Ordering::SeqCst);
        report
    }

    async fn run_pass(&self) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        info!("Ingestion pass starting");

        for source in &self.sources {
            let source_type = source.source_type();
            let users = self.store.users_with_source(source_type)?;
            info!(
                source = %source_type,
                user_count = users.len(),
                "Ingesting source"
            );

            for user_id in users {
                report.attempted += 1;
                match source.fetch(&user_id).await {
                    Ok(outcome) => {
                        // A watermark failure stays confined to this user,
                        // like any other per-user failure
                        match self.store.mark_ingested(&user_id, source_type) {
                            Ok(()) => {
                                report.succeeded += 1;
                                info!(
                                    user_id = %user_id,
                                    source = %source_type,
                                    record_count = outcome.record_count(),
                                    "Ingestion succeeded"
                                );
                            }
                            Err(e) => {
                                report.failed += 1;
                                error!(
                                    user_id = %user_id,
                                    source = %source_type,
                                    "Fetched but failed to update ingestion watermark: {}",
                                    e
                                );
                            }
                        }
                    }
                    Err(Error::AuthExpired(message)) => {
                        report.auth_expired += 1;
                        warn!(
                            user_id = %user_id,
                            source = %source_type,
                            "User must re-authorize: {}",
                            message
                        );
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(
                            user_id = %user_id,
                            source = %source_type,
                            "Ingestion failed: {}",
                            e
                        );
                    }
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            auth_expired = report.auth_expired,
            failed = report.failed,
            "Ingestion pass complete"
        );
        Ok(report)
    }
}
