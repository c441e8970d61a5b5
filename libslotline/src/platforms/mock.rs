//! Mock platform implementation for testing
//!
//! Records every protocol call in order and can be scripted to fail at a
//! specific INIT, APPEND segment, processing state, post or refresh. Clones
//! share the same recorded state, so a test can keep one handle while the
//! pipeline owns another.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CredentialError, PlatformError, Result};
use crate::platforms::{Identity, Platform, ProcessingState, TokenGrant};

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub name: String,

    /// Fail INIT with this message
    pub init_error: Option<String>,

    /// Fail APPEND for this segment index (of any upload)
    pub fail_append_segment: Option<u32>,

    /// State returned by FINALIZE
    pub finalize_state: ProcessingState,

    /// States returned by successive STATUS calls; once exhausted STATUS
    /// keeps answering `status_fallback`
    pub status_script: Vec<ProcessingState>,
    pub status_fallback: ProcessingState,

    /// Fail the post call with this 0-based call index
    pub fail_post_call: Option<usize>,

    /// Grant returned by refresh, `None` makes refresh fail
    pub refresh_grant: Option<TokenGrant>,

    /// Post ids are `post_id_base`, `post_id_base + 1`, ...
    pub post_id_base: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            init_error: None,
            fail_append_segment: None,
            finalize_state: ProcessingState::Succeeded,
            status_script: Vec::new(),
            status_fallback: ProcessingState::Succeeded,
            fail_post_call: None,
            refresh_grant: Some(TokenGrant {
                access_token: "mock-access-refreshed".to_string(),
                refresh_token: Some("mock-refresh-rotated".to_string()),
                expires_in: Some(7200),
            }),
            post_id_base: 1000,
        }
    }
}

/// One protocol call as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Refresh {
        refresh_token: String,
    },
    Init {
        token: String,
        total_bytes: u64,
        mime: String,
    },
    Append {
        media_id: String,
        segment: u32,
        len: usize,
    },
    Finalize {
        media_id: String,
    },
    Status {
        media_id: String,
    },
    Post {
        token: String,
        text: String,
        media_ids: Vec<String>,
        in_reply_to: Option<String>,
        /// Id returned to the caller, `None` when the call failed
        id: Option<String>,
    },
    WhoAmI,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    uploads: u64,
    posts: usize,
    status_script: VecDeque<ProcessingState>,
}

/// Mock platform for testing
#[derive(Clone)]
pub struct MockPlatform {
    config: MockConfig,
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        let state = MockState {
            status_script: config.status_script.iter().cloned().collect(),
            ..MockState::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A mock where every call succeeds
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// A mock whose APPEND fails for `segment`
    pub fn append_failure(segment: u32) -> Self {
        Self::new(MockConfig {
            fail_append_segment: Some(segment),
            ..Default::default()
        })
    }

    /// A mock whose `index`-th post call fails
    pub fn post_failure(index: usize) -> Self {
        Self::new(MockConfig {
            fail_post_call: Some(index),
            ..Default::default()
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Refresh { .. }))
    }

    pub fn post_call_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Post { .. }))
    }

    /// `(segment, len)` of every APPEND, in order
    pub fn appended_segments(&self) -> Vec<(u32, usize)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Append { segment, len, .. } => Some((*segment, *len)),
                _ => None,
            })
            .collect()
    }

    /// Successful posts as `(id, text, media_ids, in_reply_to)`
    pub fn posted(&self) -> Vec<(String, String, Vec<String>, Option<String>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Post {
                    text,
                    media_ids,
                    in_reply_to,
                    id: Some(id),
                    ..
                } => Some((id.clone(), text.clone(), media_ids.clone(), in_reply_to.clone())),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.state().calls.push(MockCall::Refresh {
            refresh_token: refresh_token.to_string(),
        });

        self.config
            .refresh_grant
            .clone()
            .ok_or_else(|| CredentialError::RefreshFailed("mock refresh rejected".into()).into())
    }

    async fn init_upload(&self, token: &str, total_bytes: u64, mime: &str) -> Result<String> {
        let mut state = self.state();
        state.calls.push(MockCall::Init {
            token: token.to_string(),
            total_bytes,
            mime: mime.to_string(),
        });

        if let Some(error) = &self.config.init_error {
            return Err(PlatformError::Upload(format!("INIT failed - {}", error)).into());
        }

        state.uploads += 1;
        Ok(format!("mock-media-{}", state.uploads))
    }

    async fn append_chunk(
        &self,
        _token: &str,
        media_id: &str,
        segment: u32,
        chunk: Bytes,
    ) -> Result<()> {
        self.state().calls.push(MockCall::Append {
            media_id: media_id.to_string(),
            segment,
            len: chunk.len(),
        });

        if self.config.fail_append_segment == Some(segment) {
            return Err(PlatformError::Upload(format!(
                "APPEND failed at segment {} - status 503 Service Unavailable",
                segment
            ))
            .into());
        }
        Ok(())
    }

    async fn finalize_upload(&self, _token: &str, media_id: &str) -> Result<ProcessingState> {
        self.state().calls.push(MockCall::Finalize {
            media_id: media_id.to_string(),
        });
        Ok(self.config.finalize_state.clone())
    }

    async fn upload_status(&self, _token: &str, media_id: &str) -> Result<ProcessingState> {
        let mut state = self.state();
        state.calls.push(MockCall::Status {
            media_id: media_id.to_string(),
        });
        Ok(state
            .status_script
            .pop_front()
            .unwrap_or_else(|| self.config.status_fallback.clone()))
    }

    async fn create_post(
        &self,
        token: &str,
        text: &str,
        media_ids: &[String],
        in_reply_to: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        let index = state.posts;
        state.posts += 1;

        let id = if self.config.fail_post_call == Some(index) {
            None
        } else {
            Some((self.config.post_id_base + index as u64).to_string())
        };

        state.calls.push(MockCall::Post {
            token: token.to_string(),
            text: text.to_string(),
            media_ids: media_ids.to_vec(),
            in_reply_to: in_reply_to.map(str::to_string),
            id: id.clone(),
        });

        id.ok_or_else(|| {
            PlatformError::Posting("POST failed - status 500 Internal Server Error".into()).into()
        })
    }

    async fn whoami(&self, _token: &str) -> Result<Identity> {
        self.state().calls.push(MockCall::WhoAmI);
        Ok(Identity {
            id: "1".to_string(),
            username: self.config.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_success() {
        let platform = MockPlatform::success("test");
        assert_eq!(platform.name(), "test");

        let first = platform.create_post("tok", "one", &[], None).await.unwrap();
        let second = platform
            .create_post("tok", "two", &[], Some(&first))
            .await
            .unwrap();

        assert_eq!(first, "1000");
        assert_eq!(second, "1001");
        assert_eq!(platform.post_call_count(), 2);
        assert_eq!(platform.posted()[1].3.as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn test_mock_clones_share_state() {
        let platform = MockPlatform::success("test");
        let handle = platform.clone();

        platform.init_upload("tok", 10, "image/png").await.unwrap();
        assert_eq!(handle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_append_failure() {
        let platform = MockPlatform::append_failure(1);

        platform
            .append_chunk("tok", "m", 0, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let err = platform
            .append_chunk("tok", "m", 1, Bytes::from_static(b"b"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("APPEND failed"));
        assert_eq!(platform.appended_segments(), vec![(0, 1), (1, 1)]);
    }

    #[tokio::test]
    async fn test_mock_status_script_then_fallback() {
        let platform = MockPlatform::new(MockConfig {
            status_script: vec![ProcessingState::InProgress { check_after: None }],
            status_fallback: ProcessingState::Failed("bad".into()),
            ..Default::default()
        });

        assert_eq!(
            platform.upload_status("tok", "m").await.unwrap(),
            ProcessingState::InProgress { check_after: None }
        );
        assert_eq!(
            platform.upload_status("tok", "m").await.unwrap(),
            ProcessingState::Failed("bad".into())
        );
    }

    #[tokio::test]
    async fn test_mock_post_failure_records_failed_call() {
        let platform = MockPlatform::post_failure(0);

        assert!(platform.create_post("tok", "x", &[], None).await.is_err());
        assert_eq!(platform.post_call_count(), 1);
        assert!(platform.posted().is_empty());
    }

    #[tokio::test]
    async fn test_mock_refresh_failure() {
        let platform = MockPlatform::new(MockConfig {
            refresh_grant: None,
            ..Default::default()
        });

        let err = platform.refresh_token("r1").await.unwrap_err();
        assert!(err.to_string().contains("refresh"));
        assert_eq!(platform.refresh_count(), 1);
    }
}
