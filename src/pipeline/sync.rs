//! Per-user sync runs and the background retry of failed emails.
//!
//! A user has at most one sync in flight. The registry hands out a
//! [`SyncGuard`]; dropping it (on success, error or panic unwind) frees the user.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::processor::EmailPipeline;
use crate::pipeline::types::{BatchStats, MailSource};

/// Users with a sync currently running.
#[derive(Debug, Default)]
pub struct SyncRegistry {
    active: Mutex<HashSet<String>>,
}

impl SyncRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `user_id`, or `None` if a sync for them is already running.
    pub fn try_acquire(self: &Arc<Self>, user_id: &str) -> Option<SyncGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(user_id.to_string()) {
            return None;
        }
        Some(SyncGuard {
            registry: Arc::clone(self),
            user_id: user_id.to_string(),
        })
    }

    pub fn is_syncing(&self, user_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_id)
    }
}

/// Held for the duration of one user's sync.
#[derive(Debug)]
pub struct SyncGuard {
    registry: Arc<SyncRegistry>,
    user_id: String,
}

impl SyncGuard {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.user_id);
    }
}

/// Summary of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub user_id: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: BatchStats,
    /// Stopped early; some fetched emails were left for the next run.
    pub cancelled: bool,
}

/// Fetches from a mail source and feeds the pipeline, one user at a time.
pub struct SyncRunner {
    pipeline: Arc<EmailPipeline>,
    registry: Arc<SyncRegistry>,
    config: PipelineConfig,
}

impl SyncRunner {
    pub fn new(
        pipeline: Arc<EmailPipeline>,
        registry: Arc<SyncRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pipeline,
            registry,
            config,
        }
    }

    pub fn pipeline(&self) -> &Arc<EmailPipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<SyncRegistry> {
        &self.registry
    }

    /// Fetch and process one batch for `user_id`.
    ///
    /// Fails only when another sync for the user is running or the fetch fails;
    /// per-email failures are counted in the report.
    pub async fn run_sync(
        &self,
        user_id: &str,
        source: &dyn MailSource,
        cancel: &AtomicBool,
    ) -> Result<SyncReport, PipelineError> {
        let _guard = self
            .registry
            .try_acquire(user_id)
            .ok_or_else(|| PipelineError::SyncInProgress {
                user_id: user_id.to_string(),
            })?;

        let started_at = Utc::now();
        info!(user_id, source = source.name(), "Sync started");

        let emails = tokio::time::timeout(self.config.fetch_timeout, source.fetch(user_id))
            .await
            .map_err(|_| PipelineError::FetchTimeout(self.config.fetch_timeout))??;

        let fetched = emails.len();
        let results = self
            .pipeline
            .process_batch_until(user_id, emails, cancel)
            .await;

        let report = SyncReport {
            user_id: user_id.to_string(),
            source: source.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            stats: BatchStats::from_results(fetched, &results),
            cancelled: results.len() < fetched,
        };

        info!(
            user_id,
            fetched = report.stats.fetched,
            new = report.stats.new_applications,
            updated = report.stats.updated,
            review = report.stats.review,
            duplicates = report.stats.duplicates,
            errors = report.stats.errors,
            cancelled = report.cancelled,
            "Sync finished"
        );
        Ok(report)
    }

    /// One retry pass over every user with failed emails, skipping users mid-sync.
    pub async fn retry_failed(&self) -> BatchStats {
        let users = match self.pipeline.db().list_users_with_failed_emails().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to list users with failed emails");
                return BatchStats::default();
            }
        };

        let mut results = Vec::new();
        for user_id in users {
            let Some(_guard) = self.registry.try_acquire(&user_id) else {
                debug!(user_id = %user_id, "Sync in progress, skipping retry");
                continue;
            };
            results.extend(
                self.pipeline
                    .reprocess_failed(&user_id, self.config.retry_batch_size)
                    .await,
            );
        }
        BatchStats::from_results(results.len(), &results)
    }
}

/// Spawn a background task that retries failed emails every `retry_interval`.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_retry_loop(runner: Arc<SyncRunner>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let interval = runner.config.retry_interval;

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Retry loop started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Retry loop shutting down");
                return;
            }

            let stats = runner.retry_failed().await;
            if stats.fetched > 0 {
                info!(
                    retried = stats.fetched,
                    recovered = stats.processed,
                    still_failing = stats.errors,
                    "Retry pass complete"
                );
            }
        }
    });

    (handle, shutdown_flag)
}
