//! Title generation for archived views.
//!
//! At most one run per view id at a time, enforced by the lock registry.
//! Contention is reported as `Busy` and is never queued or retried.

use crate::lock::LockRegistry;
use crate::notices::{self, Notifier};
use crate::records::{FORWARD_VIEWS, SENDER_FIELD, TITLE_FIELD, doc_id, single_field, string_field};
use crate::store::{DocumentStore, Filter};
use anyhow::Context;
use mm_titler::Summarizer;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleTrigger {
    /// Freshly archived by the ingestion pipeline.
    Ingest,
    /// Explicit rename request.
    Rebuild { requested_by: Option<String> },
    /// Startup or CLI pass over untitled views.
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleOutcome {
    Generated(String),
    Busy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub total: usize,
    pub generated: usize,
    pub busy: usize,
    pub failed: usize,
}

pub fn lock_key(view_id: &str) -> String {
    format!("rebuild_title_{view_id}")
}

pub struct TitleWorkflow {
    store: Arc<dyn DocumentStore>,
    summarizer: Arc<dyn Summarizer>,
    notifier: Notifier,
    locks: Arc<LockRegistry>,
    lock_ttl: Duration,
}

impl TitleWorkflow {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        summarizer: Arc<dyn Summarizer>,
        notifier: Notifier,
        locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            store,
            summarizer,
            notifier,
            locks,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Whether a live title run holds the lock for `view_id`.
    pub fn in_progress(&self, view_id: &str) -> bool {
        self.locks.is_held(&lock_key(view_id))
    }

    #[tracing::instrument(level = "info", skip_all, fields(view_id = %view_id, trigger = ?trigger))]
    pub async fn request_title(
        &self,
        view_id: &str,
        trigger: TitleTrigger,
    ) -> anyhow::Result<TitleOutcome> {
        let Some(guard) = self.locks.try_acquire(&lock_key(view_id), self.lock_ttl) else {
            tracing::info!("title generation already in progress");
            let current = self.current_title(view_id).await;
            self.notifier
                .group(notices::title_busy(current.as_deref()))
                .await;
            return Ok(TitleOutcome::Busy);
        };
        tracing::debug!(key = guard.key(), ttl_secs = self.lock_ttl.as_secs(), "title lock acquired");

        let view = self
            .store
            .find_one(FORWARD_VIEWS, Filter::id(view_id))
            .await
            .with_context(|| format!("load view {view_id}"))?;

        if let TitleTrigger::Rebuild { requested_by } = &trigger {
            self.notifier
                .group(notices::rename_started(
                    requested_by.as_deref(),
                    string_field(&view, TITLE_FIELD),
                ))
                .await;
        }

        let title = self
            .summarizer
            .summarize(&view)
            .await
            .with_context(|| format!("summarize view {view_id}"))?;

        self.store
            .update_fields(FORWARD_VIEWS, view_id, single_field(TITLE_FIELD, title.clone()))
            .await
            .with_context(|| format!("store title for view {view_id}"))?;
        tracing::info!(title = %title, "title stored");

        self.notifier
            .group(notices::new_title(
                string_field(&view, SENDER_FIELD),
                &title,
                view_id,
            ))
            .await;
        Ok(TitleOutcome::Generated(title))
    }

    /// Titles every view without one, one at a time. Individual failures are counted, not raised.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn sweep_untitled(&self) -> anyhow::Result<SweepReport> {
        let purged = self.locks.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "expired title locks purged");
        }

        let views = self
            .store
            .find_many(FORWARD_VIEWS, Filter::missing(TITLE_FIELD))
            .await
            .context("list untitled views")?;
        let mut report = SweepReport {
            total: views.len(),
            ..SweepReport::default()
        };
        tracing::info!(untitled = report.total, "title sweep starting");

        for view in &views {
            let Some(view_id) = doc_id(view) else {
                tracing::warn!("view without id skipped");
                report.failed += 1;
                continue;
            };
            match self.request_title(view_id, TitleTrigger::Sweep).await {
                Ok(TitleOutcome::Generated(_)) => report.generated += 1,
                Ok(TitleOutcome::Busy) => report.busy += 1,
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), view_id, "title sweep item failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            total = report.total,
            generated = report.generated,
            busy = report.busy,
            failed = report.failed,
            "title sweep finished"
        );
        Ok(report)
    }

    async fn current_title(&self, view_id: &str) -> Option<String> {
        match self.store.find_one(FORWARD_VIEWS, Filter::id(view_id)).await {
            Ok(view) => string_field(&view, TITLE_FIELD).map(str::to_string),
            Err(e) => {
                tracing::debug!(%e, "current title unavailable");
                None
            }
        }
    }
}
