//! SQLite-backed [`Store`] implementation

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result, SlotlineError};
use crate::store::{job_update_precondition, Store};
use crate::types::{
    Account, JobStatus, Media, Post, PostItem, PostRecord, PostStatus, PublishJob, TokenUpdate,
};

const JOB_COLUMNS: &str = "id, post_id, run_at, status, attempts, last_error, claimed_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Option<PublishJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }
}

fn corrupt(table: &'static str, detail: impl ToString) -> SlotlineError {
    DbError::CorruptRow {
        table,
        detail: detail.to_string(),
    }
    .into()
}

fn job_from_row(r: &SqliteRow) -> Result<PublishJob> {
    let status: String = r.get("status");
    Ok(PublishJob {
        id: r.get("id"),
        post_id: r.get("post_id"),
        run_at: r.get("run_at"),
        status: status
            .parse()
            .map_err(|e| corrupt("publish_jobs", e))?,
        attempts: r.get("attempts"),
        last_error: r.get("last_error"),
        claimed_at: r.get("claimed_at"),
    })
}

fn post_from_row(r: &SqliteRow) -> Result<Post> {
    let status: String = r.get("status");
    Ok(Post {
        id: r.get("id"),
        status: status.parse().map_err(|e| corrupt("posts", e))?,
        scheduled_at: r.get("scheduled_at"),
        platform: r.get("platform"),
        published_at: r.get("published_at"),
        created_at: r.get("created_at"),
    })
}

fn item_from_row(r: &SqliteRow) -> Result<PostItem> {
    let media_ids: String = r.get("media_ids");
    Ok(PostItem {
        id: r.get("id"),
        post_id: r.get("post_id"),
        idx: r.get("idx"),
        text: r.get("text"),
        media_ids: serde_json::from_str(&media_ids).map_err(|e| corrupt("post_items", e))?,
    })
}

fn media_from_row(r: &SqliteRow) -> Result<Media> {
    let size: i64 = r.get("size_bytes");
    Ok(Media {
        id: r.get("id"),
        bucket_path: r.get("bucket_path"),
        mime: r.get("mime"),
        size_bytes: u64::try_from(size).map_err(|e| corrupt("media", e))?,
    })
}

fn account_from_row(r: &SqliteRow) -> Account {
    Account {
        platform: r.get("platform"),
        handle: r.get("handle"),
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        expires_at: r.get("expires_at"),
        scope: r.get("scope"),
        updated_at: r.get("updated_at"),
    }
}

fn record_from_row(r: &SqliteRow) -> PostRecord {
    PostRecord {
        id: r.get("id"),
        post_id: r.get("post_id"),
        idx: r.get("idx"),
        platform: r.get("platform"),
        platform_post_id: r.get("platform_post_id"),
        in_reply_to: r.get("in_reply_to"),
        posted_at: r.get("posted_at"),
    }
}

#[async_trait]
impl Store for Database {
    async fn claim_pending_jobs(&self, limit: usize, now: i64) -> Result<Vec<PublishJob>> {
        let candidates: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM publish_jobs
            WHERE status = 'pending' AND run_at <= ?
            ORDER BY run_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for (job_id,) in candidates {
            // Another worker may have taken it between the SELECT and here
            let row = sqlx::query(&format!(
                r#"
                UPDATE publish_jobs SET status = 'running', claimed_at = ?
                WHERE id = ? AND status = 'pending'
                RETURNING {}
                "#,
                JOB_COLUMNS
            ))
            .bind(now)
            .bind(&job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            if let Some(row) = row {
                claimed.push(job_from_row(&row)?);
            }
        }

        Ok(claimed)
    }

    async fn claim_job(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publish_jobs SET status = 'running', claimed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_job(
        &self,
        job_id: &str,
        status: JobStatus,
        last_error: Option<&str>,
        attempts_delta: i64,
    ) -> Result<()> {
        let required = job_update_precondition(job_id, status, attempts_delta)?;

        let result = sqlx::query(
            r#"
            UPDATE publish_jobs SET
                status = ?,
                last_error = COALESCE(?, last_error),
                attempts = attempts + ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(attempts_delta)
        .bind(job_id)
        .bind(required.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            let current = self.fetch_job(job_id).await?;
            return Err(match current {
                Some(job) => SlotlineError::InvalidInput(format!(
                    "job {} is {}, cannot move to {}",
                    job_id, job.status, status
                )),
                None => SlotlineError::InvalidInput(format!("Job not found: {}", job_id)),
            });
        }

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<PublishJob>> {
        self.fetch_job(job_id).await
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<PublishJob>> {
        let mut query_str = format!("SELECT {} FROM publish_jobs", JOB_COLUMNS);
        if status.is_some() {
            query_str.push_str(" WHERE status = ?");
        }
        query_str.push_str(" ORDER BY run_at DESC LIMIT ?");

        let mut query = sqlx::query(&query_str);
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_post_jobs(&self, post_id: &str) -> Result<Vec<PublishJob>> {
        let query_str = format!(
            "SELECT {} FROM publish_jobs WHERE post_id = ? ORDER BY run_at ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&query_str)
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn enqueue_job(&self, post_id: &str, run_at: i64) -> Result<PublishJob> {
        if self.get_post(post_id).await?.is_none() {
            return Err(SlotlineError::InvalidInput(format!(
                "Post not found: {}",
                post_id
            )));
        }

        let job = PublishJob::new(post_id, run_at);
        sqlx::query(
            r#"
            INSERT INTO publish_jobs (id, post_id, run_at, status, attempts)
            VALUES (?, ?, ?, 'pending', 0)
            "#,
        )
        .bind(&job.id)
        .bind(&job.post_id)
        .bind(job.run_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(job)
    }

    async fn reap_stale_jobs(&self, claimed_before: i64, message: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE publish_jobs SET
                status = 'error',
                last_error = ?,
                attempts = attempts + 1
            WHERE status = 'running' AND (claimed_at IS NULL OR claimed_at < ?)
            RETURNING id
            "#,
        )
        .bind(message)
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn create_thread(
        &self,
        post: &Post,
        items: &[PostItem],
        media: &[Media],
        job: Option<&PublishJob>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        for m in media {
            // Same asset submitted twice is fine
            sqlx::query(
                r#"
                INSERT INTO media (id, bucket_path, mime, size_bytes)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&m.id)
            .bind(&m.bucket_path)
            .bind(&m.mime)
            .bind(m.size_bytes as i64)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        sqlx::query(
            r#"
            INSERT INTO posts (id, status, scheduled_at, platform, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(&post.platform)
        .bind(post.published_at)
        .bind(post.created_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for item in items {
            let media_ids = serde_json::to_string(&item.media_ids)
                .map_err(|e| SlotlineError::InvalidInput(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO post_items (id, post_id, idx, text, media_ids)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&item.post_id)
            .bind(item.idx)
            .bind(&item.text)
            .bind(media_ids)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        if let Some(job) = job {
            sqlx::query(
                r#"
                INSERT INTO publish_jobs (id, post_id, run_at, status, attempts)
                VALUES (?, ?, ?, 'pending', 0)
                "#,
            )
            .bind(&job.id)
            .bind(&job.post_id)
            .bind(job.run_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, status, scheduled_at, platform, published_at, created_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn update_post_status(
        &self,
        post_id: &str,
        status: PostStatus,
        published_at: Option<i64>,
    ) -> Result<()> {
        let current = self
            .get_post(post_id)
            .await?
            .ok_or_else(|| SlotlineError::InvalidInput(format!("Post not found: {}", post_id)))?;

        if !current.status.can_advance_to(status) {
            return Err(SlotlineError::InvalidInput(format!(
                "post {} cannot move from {} back to {}",
                post_id, current.status, status
            )));
        }

        sqlx::query(
            r#"
            UPDATE posts SET status = ?, published_at = COALESCE(?, published_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(published_at)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn list_items(&self, post_id: &str) -> Result<Vec<PostItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, idx, text, media_ids
            FROM post_items
            WHERE post_id = ?
            ORDER BY idx ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn insert_media(&self, media: &Media) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO media (id, bucket_path, mime, size_bytes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&media.id)
        .bind(&media.bucket_path)
        .bind(&media.mime)
        .bind(media.size_bytes as i64)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_media(&self, ids: &[String]) -> Result<Vec<Media>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let query_str = format!(
            "SELECT id, bucket_path, mime, size_bytes FROM media WHERE id IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&query_str);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(media_from_row).collect()
    }

    async fn record_post(&self, record: &PostRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_records (post_id, idx, platform, platform_post_id, in_reply_to, posted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.post_id)
        .bind(record.idx)
        .bind(&record.platform)
        .bind(&record.platform_post_id)
        .bind(&record.in_reply_to)
        .bind(record.posted_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn list_post_records(&self, post_id: &str) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, idx, platform, platform_post_id, in_reply_to, posted_at
            FROM post_records
            WHERE post_id = ?
            ORDER BY idx ASC, id ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn get_account(&self, platform: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT platform, handle, access_token, refresh_token, expires_at, scope, updated_at
            FROM accounts WHERE platform = ?
            "#,
        )
        .bind(platform)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(account_from_row))
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (platform, handle, access_token, refresh_token, expires_at, scope, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform) DO UPDATE SET
                handle = excluded.handle,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.platform)
        .bind(&account.handle)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.expires_at)
        .bind(&account.scope)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn update_account(
        &self,
        platform: &str,
        expected_refresh_token: Option<&str>,
        update: &TokenUpdate,
        now: i64,
    ) -> Result<bool> {
        // `IS` compares NULLs as equal
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                updated_at = ?
            WHERE platform = ? AND refresh_token IS ?
            "#,
        )
        .bind(&update.access_token)
        .bind(&update.refresh_token)
        .bind(update.expires_at)
        .bind(now)
        .bind(platform)
        .bind(expected_refresh_token)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_account(&self, platform: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE platform = ?")
            .bind(platform)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}
