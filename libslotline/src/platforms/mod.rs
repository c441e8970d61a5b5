//! Platform abstraction and implementations
//!
//! A [`Platform`] exposes the raw protocol surface the publish pipeline
//! drives: token refresh, the INIT/APPEND/FINALIZE/STATUS chunked media
//! upload, and post creation with optional media and reply parent. The
//! sequencing (chunking, polling, reply chaining) lives in
//! [`crate::upload`] and [`crate::publisher`], not in the adapters.
//!
//! # Examples
//!
//! ```no_run
//! use libslotline::config::XConfig;
//! use libslotline::platforms::{x::XPlatform, Platform};
//!
//! # async fn example() -> libslotline::error::Result<()> {
//! let platform = XPlatform::new(&XConfig::default())?;
//!
//! let id = platform.create_post("access-token", "Hello", &[], None).await?;
//! platform
//!     .create_post("access-token", "and a reply", &[], Some(&id))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;

// Mock platform is available for all builds (not just tests) to support integration tests
pub mod mock;
pub mod x;

/// Result of FINALIZE or STATUS for an uploaded asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingState {
    /// The media reference is usable
    Succeeded,
    /// Server-side processing still running. `check_after` is the platform's
    /// hint for the next STATUS call, when it gives one.
    InProgress { check_after: Option<Duration> },
    /// Terminal failure with the platform's reason
    Failed(String),
}

/// Response of a refresh-token exchange
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the platform does not rotate refresh tokens
    pub refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("rotated", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Account the token belongs to, as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

/// Protocol surface of a social platform
///
/// Every method takes the bearer token explicitly so that the caller
/// (see [`crate::tokens::TokenManager`]) owns the credential lifecycle.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Lowercase platform key, also the `accounts.platform` natural key
    fn name(&self) -> &str;

    /// Exchange a refresh token for a new access token
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::RefreshFailed` on a non-2xx response
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// INIT: declare size and MIME type, returns the upload handle
    async fn init_upload(&self, token: &str, total_bytes: u64, mime: &str) -> Result<String>;

    /// APPEND one chunk at `segment` (0-based, strictly increasing)
    async fn append_chunk(
        &self,
        token: &str,
        media_id: &str,
        segment: u32,
        chunk: Bytes,
    ) -> Result<()>;

    /// FINALIZE: close the upload
    async fn finalize_upload(&self, token: &str, media_id: &str) -> Result<ProcessingState>;

    /// STATUS: poll server-side processing
    async fn upload_status(&self, token: &str, media_id: &str) -> Result<ProcessingState>;

    /// Create a post and return its platform id
    async fn create_post(
        &self,
        token: &str,
        text: &str,
        media_ids: &[String],
        in_reply_to: Option<&str>,
    ) -> Result<String>;

    /// Look up the account that owns `token`
    async fn whoami(&self, token: &str) -> Result<Identity>;
}
