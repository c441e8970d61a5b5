//! Job scheduler and claimer
//!
//! One [`Scheduler::tick`] claims a bounded batch of due jobs and runs each
//! one to completion, sequentially. Claiming is a compare-and-set in the
//! store, so several schedulers may share one database. A failing job is
//! recorded and the batch moves on; nothing is retried automatically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, SlotlineError};
use crate::platforms::Platform;
use crate::publisher::ThreadPublisher;
use crate::storage::ObjectStorage;
use crate::store::Store;
use crate::tokens::TokenManager;
use crate::types::{JobStatus, Media, PostStatus, PublishJob};
use crate::upload::ChunkedUploader;

/// Source of the current Unix time. Read at the start and end of every job,
/// so a long batch never refreshes or stamps with a stale clock.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub reaped: usize,
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    tokens: TokenManager,
    publisher: ThreadPublisher,
    batch_size: usize,
    stale_after_secs: Option<i64>,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        storage: Arc<dyn ObjectStorage>,
        config: &Config,
    ) -> Self {
        let tokens = TokenManager::new(
            store.clone(),
            platform.clone(),
            config.tokens.refresh_skew_secs,
        );
        let uploader = ChunkedUploader::from_config(platform.clone(), storage, &config.upload);
        let publisher = ThreadPublisher::new(platform.clone(), uploader, store.clone());

        Self {
            store,
            platform,
            tokens,
            publisher,
            batch_size: config.scheduler.batch_size,
            stale_after_secs: config
                .scheduler
                .stale_after_secs
                .and_then(|secs| i64::try_from(secs).ok()),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stale_after(mut self, secs: Option<i64>) -> Self {
        self.stale_after_secs = secs;
        self
    }

    /// Reap stale jobs (if enabled), claim up to `batch_size` jobs due by
    /// `now` and run each of them. Token decisions and timestamps inside a
    /// job use the scheduler's clock instead of `now`.
    ///
    /// # Errors
    ///
    /// Only store failures while reaping or claiming abort the tick. Errors
    /// inside a job are recorded on that job.
    pub async fn tick(&self, now: i64) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        if let Some(stale_after) = self.stale_after_secs {
            let reaped = self
                .store
                .reap_stale_jobs(
                    now - stale_after,
                    &format!("abandoned: still running after {}s", stale_after),
                )
                .await?;
            for job_id in &reaped {
                tracing::warn!(job_id = %job_id, "reaped stale running job");
            }
            summary.reaped = reaped.len();
        }

        let jobs = self.store.claim_pending_jobs(self.batch_size, now).await?;
        summary.claimed = jobs.len();
        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "claimed due jobs");
        }

        for job in &jobs {
            if self.process(job).await {
                summary.published += 1;
            } else {
                summary.failed += 1;
            }
        }

        Ok(summary)
    }

    /// Run a claimed job and record its outcome. Returns whether it
    /// succeeded.
    #[tracing::instrument(name = "job", skip_all, fields(job_id = %job.id, post_id = %job.post_id))]
    async fn process(&self, job: &PublishJob) -> bool {
        let started_at = (self.clock)();
        let outcome = match self.run_job(job, started_at).await {
            Ok(count) => {
                let published_at = (self.clock)();
                self.store
                    .update_post_status(&job.post_id, PostStatus::Published, Some(published_at))
                    .await
                    .map(|_| count)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(count) => {
                if let Err(e) = self
                    .store
                    .update_job(&job.id, JobStatus::Done, None, 0)
                    .await
                {
                    tracing::error!(error = %e, "published but failed to mark job done");
                    return false;
                }
                tracing::info!(items = count, "thread published");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, category = ?e.category(), "job failed");
                if let Err(store_err) = self
                    .store
                    .update_job(&job.id, JobStatus::Error, Some(&e.to_string()), 1)
                    .await
                {
                    tracing::error!(error = %store_err, "failed to record job error");
                }
                false
            }
        }
    }

    /// Load the thread, get a valid token, publish. Returns the item count.
    async fn run_job(&self, job: &PublishJob, now: i64) -> Result<usize> {
        let post = self.store.get_post(&job.post_id).await?.ok_or_else(|| {
            SlotlineError::InvalidInput(format!("post {} not found", job.post_id))
        })?;

        match post.status {
            PostStatus::Queued | PostStatus::Scheduled => {}
            PostStatus::Published | PostStatus::Draft => {
                return Err(SlotlineError::InvalidInput(format!(
                    "post {} is {}, refusing to publish it",
                    post.id, post.status
                )));
            }
        }

        if post.platform != self.platform.name() {
            return Err(SlotlineError::InvalidInput(format!(
                "post {} targets platform {}, this worker publishes to {}",
                post.id,
                post.platform,
                self.platform.name()
            )));
        }

        let items = self.store.list_items(&post.id).await?;
        crate::publisher::validate_items(&post.id, &items)?;

        let mut seen = HashSet::new();
        let media_ids: Vec<String> = items
            .iter()
            .flat_map(|item| item.media_ids.iter().cloned())
            .filter(|id| seen.insert(id.clone()))
            .collect();
        let media: HashMap<String, Media> = self
            .store
            .get_media(&media_ids)
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        if let Some(missing) = media_ids.iter().find(|id| !media.contains_key(*id)) {
            return Err(SlotlineError::InvalidInput(format!(
                "post {} references missing media {}",
                post.id, missing
            )));
        }

        let account = self.tokens.current(now).await?;

        let posted = self
            .publisher
            .publish(&account.access_token, &post.id, &items, &media, now)
            .await?;
        Ok(posted.len())
    }
}
