//! Data-access interface used by the publish pipeline
//!
//! The pipeline never talks to a database client directly. Everything it
//! needs from the relational store goes through [`Store`], which is
//! implemented by the SQLite-backed [`crate::db::Database`] and by the
//! in-memory [`memory::MemoryStore`] used in tests.
//!
//! Implementations must uphold these invariants:
//! - claiming a job is a compare-and-set on `status = pending`, so two
//!   workers never both receive the same job
//! - job status only moves along `pending -> running -> {done, error}`
//! - `attempts` only grows, and only on a transition into `error`
//! - one account row per platform
//! - inserting an existing media id is a no-op

use async_trait::async_trait;

use crate::error::{Result, SlotlineError};
use crate::types::{
    Account, JobStatus, Media, Post, PostItem, PostRecord, PostStatus, PublishJob, TokenUpdate,
};

pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Claim up to `limit` due jobs (`pending`, `run_at <= now`), oldest
    /// `run_at` first. Only the jobs this caller won are returned, already
    /// in `running` state.
    async fn claim_pending_jobs(&self, limit: usize, now: i64) -> Result<Vec<PublishJob>>;

    /// Compare-and-set a single job from `pending` to `running`.
    ///
    /// Returns `false` when someone else got there first.
    async fn claim_job(&self, job_id: &str, now: i64) -> Result<bool>;

    /// Move a job to `status`, recording `last_error` and adding
    /// `attempts_delta` to its attempt counter.
    ///
    /// # Errors
    ///
    /// Returns `SlotlineError::InvalidInput` when the job is not in the
    /// status that precedes `status`, or when a non-zero `attempts_delta`
    /// is used for anything other than a transition into `error`.
    async fn update_job(
        &self,
        job_id: &str,
        status: JobStatus,
        last_error: Option<&str>,
        attempts_delta: i64,
    ) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<PublishJob>>;

    /// Most recent jobs first
    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<PublishJob>>;

    /// Every job of one post, oldest `run_at` first
    async fn list_post_jobs(&self, post_id: &str) -> Result<Vec<PublishJob>>;

    /// Create a fresh `pending` job for an existing post
    async fn enqueue_job(&self, post_id: &str, run_at: i64) -> Result<PublishJob>;

    /// Fail every job that has been `running` since before `claimed_before`.
    ///
    /// Returns the ids of the jobs that were moved to `error`.
    async fn reap_stale_jobs(&self, claimed_before: i64, message: &str) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // Posts, items and media
    // ------------------------------------------------------------------

    /// Persist a submitted thread in one unit: media (idempotent), the post,
    /// its items and, unless it is a draft, its publish job.
    async fn create_thread(
        &self,
        post: &Post,
        items: &[PostItem],
        media: &[Media],
        job: Option<&PublishJob>,
    ) -> Result<()>;

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>>;

    /// # Errors
    ///
    /// Returns `SlotlineError::InvalidInput` if the post does not exist or if
    /// `status` would move the post backwards.
    async fn update_post_status(
        &self,
        post_id: &str,
        status: PostStatus,
        published_at: Option<i64>,
    ) -> Result<()>;

    /// Items of a post ordered by `idx`
    async fn list_items(&self, post_id: &str) -> Result<Vec<PostItem>>;

    /// Insert a media row. Returns `false` if the id already existed.
    async fn insert_media(&self, media: &Media) -> Result<bool>;

    /// Media rows for the given ids, in no particular order. Unknown ids are
    /// simply absent from the result.
    async fn get_media(&self, ids: &[String]) -> Result<Vec<Media>>;

    async fn record_post(&self, record: &PostRecord) -> Result<()>;

    /// Platform posts made for a thread, ordered by `idx`
    async fn list_post_records(&self, post_id: &str) -> Result<Vec<PostRecord>>;

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    async fn get_account(&self, platform: &str) -> Result<Option<Account>>;

    /// Insert or replace the credential for `account.platform` (last writer wins)
    async fn upsert_account(&self, account: &Account) -> Result<()>;

    /// Write rotated tokens, but only if the stored refresh token still equals
    /// `expected_refresh_token`. Returns `false` if another writer rotated
    /// the credential first.
    async fn update_account(
        &self,
        platform: &str,
        expected_refresh_token: Option<&str>,
        update: &TokenUpdate,
        now: i64,
    ) -> Result<bool>;

    /// Returns `true` if an account was removed
    async fn delete_account(&self, platform: &str) -> Result<bool>;
}

/// Shared precondition check for [`Store::update_job`] implementations.
///
/// Returns the status the job must currently hold.
pub(crate) fn job_update_precondition(
    job_id: &str,
    status: JobStatus,
    attempts_delta: i64,
) -> Result<JobStatus> {
    if attempts_delta < 0 {
        return Err(SlotlineError::InvalidInput(format!(
            "attempts of job {} cannot decrease",
            job_id
        )));
    }
    if attempts_delta != 0 && status != JobStatus::Error {
        return Err(SlotlineError::InvalidInput(format!(
            "attempts of job {} may only grow on a transition into error",
            job_id
        )));
    }
    status.predecessor().ok_or_else(|| {
        SlotlineError::InvalidInput(format!("job {} cannot be moved back to {}", job_id, status))
    })
}
