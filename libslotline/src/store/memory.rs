//! In-memory [`Store`] implementation
//!
//! Holds every table behind a single mutex, which makes each trait method
//! atomic. Used by unit and integration tests, and handy for dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{job_update_precondition, Store};
use crate::error::{Result, SlotlineError};
use crate::types::{
    Account, JobStatus, Media, Post, PostItem, PostRecord, PostStatus, PublishJob, TokenUpdate,
};

#[derive(Default)]
struct Tables {
    posts: HashMap<String, Post>,
    items: Vec<PostItem>,
    media: HashMap<String, Media>,
    accounts: HashMap<String, Account>,
    jobs: Vec<PublishJob>,
    records: Vec<PostRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves the tables consistent: every
        // method validates before it mutates.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn claim_pending_jobs(&self, limit: usize, now: i64) -> Result<Vec<PublishJob>> {
        let mut tables = self.lock();

        let mut due: Vec<usize> = tables
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status == JobStatus::Pending && job.run_at <= now)
            .map(|(pos, _)| pos)
            .collect();
        due.sort_by_key(|&pos| tables.jobs[pos].run_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for pos in due {
            let job = &mut tables.jobs[pos];
            job.status = JobStatus::Running;
            job.claimed_at = Some(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn claim_job(&self, job_id: &str, now: i64) -> Result<bool> {
        let mut tables = self.lock();
        match tables
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id && job.status == JobStatus::Pending)
        {
            Some(job) => {
                job.status = JobStatus::Running;
                job.claimed_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_job(
        &self,
        job_id: &str,
        status: JobStatus,
        last_error: Option<&str>,
        attempts_delta: i64,
    ) -> Result<()> {
        let required = job_update_precondition(job_id, status, attempts_delta)?;
        let mut tables = self.lock();

        let job = tables
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| SlotlineError::InvalidInput(format!("Job not found: {}", job_id)))?;

        if job.status != required {
            return Err(SlotlineError::InvalidInput(format!(
                "job {} is {}, cannot move to {}",
                job_id, job.status, status
            )));
        }

        job.status = status;
        if let Some(message) = last_error {
            job.last_error = Some(message.to_string());
        }
        job.attempts += attempts_delta;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<PublishJob>> {
        Ok(self.lock().jobs.iter().find(|job| job.id == job_id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<PublishJob>> {
        let tables = self.lock();
        let mut jobs: Vec<PublishJob> = tables
            .jobs
            .iter()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.run_at.cmp(&a.run_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_post_jobs(&self, post_id: &str) -> Result<Vec<PublishJob>> {
        let tables = self.lock();
        let mut jobs: Vec<PublishJob> = tables
            .jobs
            .iter()
            .filter(|job| job.post_id == post_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.run_at);
        Ok(jobs)
    }

    async fn enqueue_job(&self, post_id: &str, run_at: i64) -> Result<PublishJob> {
        let mut tables = self.lock();
        if !tables.posts.contains_key(post_id) {
            return Err(SlotlineError::InvalidInput(format!(
                "Post not found: {}",
                post_id
            )));
        }
        let job = PublishJob::new(post_id, run_at);
        tables.jobs.push(job.clone());
        Ok(job)
    }

    async fn reap_stale_jobs(&self, claimed_before: i64, message: &str) -> Result<Vec<String>> {
        let mut tables = self.lock();
        let mut reaped = Vec::new();
        for job in tables.jobs.iter_mut() {
            let stale = job.status == JobStatus::Running
                && job.claimed_at.map_or(true, |at| at < claimed_before);
            if stale {
                job.status = JobStatus::Error;
                job.last_error = Some(message.to_string());
                job.attempts += 1;
                reaped.push(job.id.clone());
            }
        }
        Ok(reaped)
    }

    async fn create_thread(
        &self,
        post: &Post,
        items: &[PostItem],
        media: &[Media],
        job: Option<&PublishJob>,
    ) -> Result<()> {
        let mut tables = self.lock();

        if tables.posts.contains_key(&post.id) {
            return Err(SlotlineError::InvalidInput(format!(
                "Post already exists: {}",
                post.id
            )));
        }
        if let Some(job) = job {
            if job.post_id != post.id {
                return Err(SlotlineError::InvalidInput(format!(
                    "Job {} does not belong to post {}",
                    job.id, post.id
                )));
            }
        }
        let mut seen_idx = std::collections::HashSet::new();
        for item in items {
            if item.post_id != post.id {
                return Err(SlotlineError::InvalidInput(format!(
                    "Item {} does not belong to post {}",
                    item.id, post.id
                )));
            }
            if !seen_idx.insert(item.idx) {
                return Err(SlotlineError::InvalidInput(format!(
                    "Duplicate idx {} in post {}",
                    item.idx, post.id
                )));
            }
        }

        for m in media {
            tables.media.entry(m.id.clone()).or_insert_with(|| m.clone());
        }
        tables.posts.insert(post.id.clone(), post.clone());
        tables.items.extend(items.iter().cloned());
        if let Some(job) = job {
            tables.jobs.push(job.clone());
        }
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        Ok(self.lock().posts.get(post_id).cloned())
    }

    async fn update_post_status(
        &self,
        post_id: &str,
        status: PostStatus,
        published_at: Option<i64>,
    ) -> Result<()> {
        let mut tables = self.lock();
        let post = tables
            .posts
            .get_mut(post_id)
            .ok_or_else(|| SlotlineError::InvalidInput(format!("Post not found: {}", post_id)))?;

        if !post.status.can_advance_to(status) {
            return Err(SlotlineError::InvalidInput(format!(
                "post {} cannot move from {} back to {}",
                post_id, post.status, status
            )));
        }

        post.status = status;
        if published_at.is_some() {
            post.published_at = published_at;
        }
        Ok(())
    }

    async fn list_items(&self, post_id: &str) -> Result<Vec<PostItem>> {
        let tables = self.lock();
        let mut items: Vec<PostItem> = tables
            .items
            .iter()
            .filter(|item| item.post_id == post_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.idx);
        Ok(items)
    }

    async fn insert_media(&self, media: &Media) -> Result<bool> {
        let mut tables = self.lock();
        if tables.media.contains_key(&media.id) {
            return Ok(false);
        }
        tables.media.insert(media.id.clone(), media.clone());
        Ok(true)
    }

    async fn get_media(&self, ids: &[String]) -> Result<Vec<Media>> {
        let tables = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| tables.media.get(id).cloned())
            .collect())
    }

    async fn record_post(&self, record: &PostRecord) -> Result<()> {
        let mut tables = self.lock();
        let mut record = record.clone();
        record.id = Some(tables.records.len() as i64 + 1);
        tables.records.push(record);
        Ok(())
    }

    async fn list_post_records(&self, post_id: &str) -> Result<Vec<PostRecord>> {
        let tables = self.lock();
        let mut records: Vec<PostRecord> = tables
            .records
            .iter()
            .filter(|record| record.post_id == post_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.idx);
        Ok(records)
    }

    async fn get_account(&self, platform: &str) -> Result<Option<Account>> {
        Ok(self.lock().accounts.get(platform).cloned())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.lock()
            .accounts
            .insert(account.platform.clone(), account.clone());
        Ok(())
    }

    async fn update_account(
        &self,
        platform: &str,
        expected_refresh_token: Option<&str>,
        update: &TokenUpdate,
        now: i64,
    ) -> Result<bool> {
        let mut tables = self.lock();
        let Some(account) = tables.accounts.get_mut(platform) else {
            return Ok(false);
        };
        if account.refresh_token.as_deref() != expected_refresh_token {
            return Ok(false);
        }

        account.access_token = update.access_token.clone();
        if update.refresh_token.is_some() {
            account.refresh_token = update.refresh_token.clone();
        }
        account.expires_at = update.expires_at;
        account.updated_at = now;
        Ok(true)
    }

    async fn delete_account(&self, platform: &str) -> Result<bool> {
        Ok(self.lock().accounts.remove(platform).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PLATFORM_X;
    use std::sync::Arc;

    fn thread(store_post_status: PostStatus) -> (Post, Vec<PostItem>) {
        let post = Post::new(PLATFORM_X, store_post_status, None);
        let items = (0..2)
            .map(|idx| PostItem {
                id: format!("{}-{}", post.id, idx),
                post_id: post.id.clone(),
                idx,
                text: format!("item {}", idx),
                media_ids: vec![],
            })
            .collect();
        (post, items)
    }

    #[tokio::test]
    async fn test_claim_orders_by_run_at_and_respects_limit() {
        let store = MemoryStore::new();
        let (post, items) = thread(PostStatus::Queued);
        store.create_thread(&post, &items, &[], None).await.unwrap();

        let late = store.enqueue_job(&post.id, 300).await.unwrap();
        let early = store.enqueue_job(&post.id, 100).await.unwrap();
        let _future = store.enqueue_job(&post.id, 10_000).await.unwrap();

        let claimed = store.claim_pending_jobs(5, 500).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), late.id.as_str()]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Running));

        // Nothing left that is due
        assert!(store.claim_pending_jobs(5, 500).await.unwrap().is_empty());

        let history: Vec<i64> = store
            .list_post_jobs(&post.id)
            .await
            .unwrap()
            .iter()
            .map(|j| j.run_at)
            .collect();
        assert_eq!(history, vec![100, 300, 10_000]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let (post, items) = thread(PostStatus::Queued);
        let job = PublishJob::new(&post.id, 0);
        store
            .create_thread(&post, &items, &[], Some(&job))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let job_id = job.id.clone();
            handles.push(tokio::spawn(async move {
                store.claim_job(&job_id, 1).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_update_job_enforces_transitions() {
        let store = MemoryStore::new();
        let (post, items) = thread(PostStatus::Queued);
        let job = PublishJob::new(&post.id, 0);
        store
            .create_thread(&post, &items, &[], Some(&job))
            .await
            .unwrap();

        // pending -> done is not allowed
        assert!(store
            .update_job(&job.id, JobStatus::Done, None, 0)
            .await
            .is_err());

        assert!(store.claim_job(&job.id, 1).await.unwrap());
        store
            .update_job(&job.id, JobStatus::Error, Some("boom"), 1)
            .await
            .unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));

        // error is terminal
        assert!(store
            .update_job(&job.id, JobStatus::Error, Some("again"), 1)
            .await
            .is_err());
        assert_eq!(store.get_job(&job.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_media_insert_is_idempotent() {
        let store = MemoryStore::new();
        let media = Media {
            id: "m1".to_string(),
            bucket_path: "u/1/a.png".to_string(),
            mime: "image/png".to_string(),
            size_bytes: 10,
        };

        assert!(store.insert_media(&media).await.unwrap());
        let mut changed = media.clone();
        changed.size_bytes = 99;
        assert!(!store.insert_media(&changed).await.unwrap());

        let rows = store
            .get_media(&["m1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(rows, vec![media]);
    }

    #[tokio::test]
    async fn test_update_account_is_conditional_on_refresh_token() {
        let store = MemoryStore::new();
        store
            .upsert_account(&Account {
                platform: PLATFORM_X.to_string(),
                handle: None,
                access_token: "a1".to_string(),
                refresh_token: Some("r1".to_string()),
                expires_at: Some(100),
                scope: None,
                updated_at: 0,
            })
            .await
            .unwrap();

        let update = TokenUpdate {
            access_token: "a2".to_string(),
            refresh_token: Some("r2".to_string()),
            expires_at: Some(7300),
        };
        assert!(!store
            .update_account(PLATFORM_X, Some("stale"), &update, 50)
            .await
            .unwrap());
        assert!(store
            .update_account(PLATFORM_X, Some("r1"), &update, 50)
            .await
            .unwrap());

        let account = store.get_account(PLATFORM_X).await.unwrap().unwrap();
        assert_eq!(account.access_token, "a2");
        assert_eq!(account.refresh_token.as_deref(), Some("r2"));
        assert_eq!(account.expires_at, Some(7300));
    }

    #[tokio::test]
    async fn test_post_status_cannot_regress() {
        let store = MemoryStore::new();
        let (post, items) = thread(PostStatus::Queued);
        store.create_thread(&post, &items, &[], None).await.unwrap();

        store
            .update_post_status(&post.id, PostStatus::Published, Some(42))
            .await
            .unwrap();
        assert!(store
            .update_post_status(&post.id, PostStatus::Queued, None)
            .await
            .is_err());

        let stored = store.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Published);
        assert_eq!(stored.published_at, Some(42));
    }
}
