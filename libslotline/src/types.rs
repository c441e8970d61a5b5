//! Core types for Slotline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SlotlineError;

/// Platform key of the X adapter, the natural key of its account row
pub const PLATFORM_X: &str = "x";

/// A thread as stored. Items live in [`PostItem`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: String,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub platform: String,
    pub published_at: Option<i64>,
    pub created_at: i64,
}

impl Post {
    pub fn new(platform: &str, status: PostStatus, scheduled_at: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status,
            scheduled_at,
            platform: platform.to_string(),
            published_at: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Queued,
    Scheduled,
    Published,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Queued => "queued",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
        }
    }

    /// Position in the forward-only lifecycle. Queued and scheduled share a
    /// rank: both are waiting on a job.
    fn rank(&self) -> u8 {
        match self {
            PostStatus::Draft => 0,
            PostStatus::Queued | PostStatus::Scheduled => 1,
            PostStatus::Published => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status moving forward
    pub fn can_advance_to(&self, next: PostStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = SlotlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "queued" => Ok(PostStatus::Queued),
            "scheduled" => Ok(PostStatus::Scheduled),
            "published" => Ok(PostStatus::Published),
            other => Err(SlotlineError::InvalidInput(format!(
                "Unknown post status: {}",
                other
            ))),
        }
    }
}

/// One message of a thread. `idx` is both publish order and reply-chain order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostItem {
    pub id: String,
    pub post_id: String,
    pub idx: i64,
    pub text: String,
    pub media_ids: Vec<String>,
}

/// A stored binary asset, referenced by id from zero or more items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Media {
    pub id: String,
    pub bucket_path: String,
    pub mime: String,
    pub size_bytes: u64,
}

/// Platform credential. One row per platform.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub platform: String,
    pub handle: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub scope: Option<String>,
    pub updated_at: i64,
}

impl Account {
    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            platform: self.platform.clone(),
            handle: self.handle.clone(),
            scope: self.scope.clone(),
            expires_at: self.expires_at,
            can_refresh: self.refresh_token.is_some(),
            updated_at: self.updated_at,
        }
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("platform", &self.platform)
            .field("handle", &self.handle)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Token-free view of an account for status output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSummary {
    pub platform: String,
    pub handle: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<i64>,
    pub can_refresh: bool,
    pub updated_at: i64,
}

/// Fields written back after a token refresh
#[derive(Clone, PartialEq)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

impl fmt::Debug for TokenUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenUpdate")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishJob {
    pub id: String,
    pub post_id: String,
    pub run_at: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// When the job entered `running`
    pub claimed_at: Option<i64>,
}

impl PublishJob {
    pub fn new(post_id: &str, run_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            post_id: post_id.to_string(),
            run_at,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// pending -> running -> {done, error}
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.predecessor() == Some(*self)
    }

    /// The only status a job may hold right before entering `self`
    pub fn predecessor(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Pending => None,
            JobStatus::Running => Some(JobStatus::Pending),
            JobStatus::Done | JobStatus::Error => Some(JobStatus::Running),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SlotlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(SlotlineError::InvalidInput(format!(
                "Unknown job status: {}",
                other
            ))),
        }
    }
}

/// A platform post made for one thread item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostRecord {
    pub id: Option<i64>,
    pub post_id: String,
    pub idx: i64,
    pub platform: String,
    pub platform_post_id: String,
    pub in_reply_to: Option<String>,
    pub posted_at: i64,
}
