//! Thread submission
//!
//! Validates a composed thread and stores it as a post, its items, the
//! media rows it references and (unless it is a draft) one pending publish
//! job, all in one store call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Result, SlotlineError};
use crate::store::Store;
use crate::types::{Media, Post, PostItem, PostStatus, PublishJob, PLATFORM_X};

pub const MAX_ITEMS: usize = 10;
/// Counted in extended grapheme clusters, so a ZWJ emoji sequence is one
pub const MAX_TEXT_GRAPHEMES: usize = 280;
pub const MAX_MEDIA_PER_ITEM: usize = 4;
/// A scheduled thread must be at least this far in the future
pub const MIN_SCHEDULE_LEAD_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    Draft,
    #[default]
    Queue,
}

/// A media object already uploaded to object storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSubmission {
    pub id: String,
    pub path: String,
    pub mime: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSubmission {
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaSubmission>,
}

/// A composed thread, as read from `slot-queue submit`
///
/// ```json
/// {
///   "kind": "queue",
///   "scheduled_at": "2025-08-01T15:00:00Z",
///   "items": [
///     { "text": "1/ Launch day" },
///     { "text": "2/ Screenshots", "media": [
///       { "id": "7b0c...", "path": "u/1/shot.png", "mime": "image/png", "size": 48213 }
///     ] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSubmission {
    #[serde(default)]
    pub kind: SubmissionKind,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub items: Vec<ItemSubmission>,
}

fn default_platform() -> String {
    PLATFORM_X.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmittedThread {
    pub post_id: String,
    pub status: PostStatus,
    pub job_id: Option<String>,
    pub run_at: Option<i64>,
}

impl ThreadSubmission {
    /// Check limits. `now` is used for the scheduling lead time.
    pub fn validate(&self, now: i64) -> Result<()> {
        if self.items.is_empty() {
            return Err(invalid("thread needs at least one item"));
        }
        if self.items.len() > MAX_ITEMS {
            return Err(invalid(format!(
                "thread has {} items, at most {} allowed",
                self.items.len(),
                MAX_ITEMS
            )));
        }
        if self.platform != PLATFORM_X {
            return Err(invalid(format!("unsupported platform: {}", self.platform)));
        }

        for (idx, item) in self.items.iter().enumerate() {
            if item.text.trim().is_empty() {
                return Err(invalid(format!("item {} has no text", idx)));
            }
            let length = item.text.graphemes(true).count();
            if length > MAX_TEXT_GRAPHEMES {
                return Err(invalid(format!(
                    "item {} is {} characters, max {}",
                    idx, length, MAX_TEXT_GRAPHEMES
                )));
            }
            if item.media.len() > MAX_MEDIA_PER_ITEM {
                return Err(invalid(format!(
                    "item {} has {} media, max {}",
                    idx,
                    item.media.len(),
                    MAX_MEDIA_PER_ITEM
                )));
            }
            for m in &item.media {
                if uuid::Uuid::parse_str(&m.id).is_err() {
                    return Err(invalid(format!("media id {} is not a UUID", m.id)));
                }
                if m.path.trim().is_empty() || m.mime.trim().is_empty() {
                    return Err(invalid(format!("media {} needs a path and a mime type", m.id)));
                }
            }
        }

        // Drafts keep a tentative time without the lead-time rule
        if let (SubmissionKind::Queue, Some(at)) = (self.kind, self.scheduled_at) {
            if at.timestamp() < now + MIN_SCHEDULE_LEAD_SECS {
                return Err(invalid(format!(
                    "scheduled time must be at least {} minutes ahead",
                    MIN_SCHEDULE_LEAD_SECS / 60
                )));
            }
        }

        Ok(())
    }

    fn status(&self) -> PostStatus {
        match (self.kind, self.scheduled_at) {
            (SubmissionKind::Draft, _) => PostStatus::Draft,
            (SubmissionKind::Queue, Some(_)) => PostStatus::Scheduled,
            (SubmissionKind::Queue, None) => PostStatus::Queued,
        }
    }
}

fn invalid(message: impl Into<String>) -> SlotlineError {
    SlotlineError::InvalidInput(message.into())
}

/// Validate and persist a thread
///
/// Media is deduplicated by id (first occurrence wins) and inserted
/// idempotently. Items get idx `0..n-1` in submission order. Non-draft
/// threads get one pending job at `scheduled_at`, or at `now` when queued
/// for immediate publication.
pub async fn submit_thread(
    store: &dyn Store,
    submission: ThreadSubmission,
    now: i64,
) -> Result<SubmittedThread> {
    submission.validate(now)?;

    let status = submission.status();
    let scheduled_at = submission.scheduled_at.map(|at| at.timestamp());

    let mut post = Post::new(&submission.platform, status, scheduled_at);
    post.created_at = now;

    let mut seen = HashSet::new();
    let mut media = Vec::new();
    let mut items = Vec::with_capacity(submission.items.len());

    for (idx, item) in submission.items.into_iter().enumerate() {
        let mut media_ids = Vec::with_capacity(item.media.len());
        for m in item.media {
            media_ids.push(m.id.clone());
            if seen.insert(m.id.clone()) {
                media.push(Media {
                    id: m.id,
                    bucket_path: m.path,
                    mime: m.mime,
                    size_bytes: m.size,
                });
            }
        }

        items.push(PostItem {
            id: uuid::Uuid::new_v4().to_string(),
            post_id: post.id.clone(),
            idx: idx as i64,
            text: item.text,
            media_ids,
        });
    }

    let job = match status {
        PostStatus::Draft => None,
        _ => Some(PublishJob::new(&post.id, scheduled_at.unwrap_or(now))),
    };

    store
        .create_thread(&post, &items, &media, job.as_ref())
        .await?;

    tracing::info!(
        post_id = %post.id,
        status = %status,
        items = items.len(),
        media = media.len(),
        "thread submitted"
    );

    Ok(SubmittedThread {
        post_id: post.id,
        status,
        run_at: job.as_ref().map(|j| j.run_at),
        job_id: job.map(|j| j.id),
    })
}
