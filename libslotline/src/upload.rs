//! Chunked media upload client
//!
//! Drives one asset through INIT, APPEND (fixed-size chunks, segments
//! 0, 1, 2, ... each acknowledged before the next), FINALIZE and, when the
//! platform is still processing, bounded STATUS polling. Bytes are streamed
//! from object storage and re-framed into exact chunk sizes on the way.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{UploadConfig, DEFAULT_CHUNK_SIZE};
use crate::error::{PlatformError, Result, SlotlineError, StorageError};
use crate::platforms::{Platform, ProcessingState};
use crate::storage::ObjectStorage;
use crate::types::Media;

/// Fixed-interval, bounded STATUS polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            max_attempts: 20,
        }
    }
}

/// Terminal result of STATUS polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded,
    Failed(String),
    TimedOut { attempts: u32 },
}

/// Poll STATUS until the platform reports a terminal state or the policy
/// runs out of attempts. Sleeps before every poll.
pub async fn poll_processing(
    platform: &dyn Platform,
    token: &str,
    media_id: &str,
    policy: PollPolicy,
) -> Result<PollOutcome> {
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;

        match platform.upload_status(token, media_id).await? {
            ProcessingState::Succeeded => return Ok(PollOutcome::Succeeded),
            ProcessingState::Failed(reason) => return Ok(PollOutcome::Failed(reason)),
            ProcessingState::InProgress { check_after } => {
                tracing::debug!(media_id, attempt, ?check_after, "media still processing");
            }
        }
    }

    Ok(PollOutcome::TimedOut {
        attempts: policy.max_attempts,
    })
}

pub struct ChunkedUploader {
    platform: Arc<dyn Platform>,
    storage: Arc<dyn ObjectStorage>,
    chunk_size: usize,
    poll: PollPolicy,
}

impl ChunkedUploader {
    pub fn new(platform: Arc<dyn Platform>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            platform,
            storage,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll: PollPolicy::default(),
        }
    }

    pub fn from_config(
        platform: Arc<dyn Platform>,
        storage: Arc<dyn ObjectStorage>,
        config: &UploadConfig,
    ) -> Self {
        Self::new(platform, storage)
            .with_chunk_size(config.chunk_size_bytes)
            .with_poll_policy(PollPolicy {
                interval: config.status_poll_interval(),
                max_attempts: config.status_max_attempts,
            })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Upload one asset and return the platform media reference
    ///
    /// # Errors
    ///
    /// Any failed command aborts the upload. A processing failure or
    /// polling timeout is a `PlatformError::Processing`; a stream whose
    /// length disagrees with `media.size_bytes` is `StorageError::SizeMismatch`.
    pub async fn upload(&self, token: &str, media: &Media) -> Result<String> {
        if media.size_bytes == 0 {
            return Err(SlotlineError::InvalidInput(format!(
                "media {} is empty",
                media.id
            )));
        }

        let media_id = self
            .platform
            .init_upload(token, media.size_bytes, &media.mime)
            .await?;
        tracing::debug!(media = %media.id, media_id = %media_id, size = media.size_bytes, "upload initialized");

        let segments = self.append_all(token, &media_id, media).await?;

        let state = self.platform.finalize_upload(token, &media_id).await?;
        let outcome = match state {
            ProcessingState::Succeeded => PollOutcome::Succeeded,
            ProcessingState::Failed(reason) => PollOutcome::Failed(reason),
            ProcessingState::InProgress { .. } => {
                poll_processing(self.platform.as_ref(), token, &media_id, self.poll).await?
            }
        };

        match outcome {
            PollOutcome::Succeeded => {
                tracing::info!(media = %media.id, media_id = %media_id, segments, "media uploaded");
                Ok(media_id)
            }
            PollOutcome::Failed(reason) => Err(PlatformError::Processing(format!(
                "media {} failed processing: {}",
                media.id, reason
            ))
            .into()),
            PollOutcome::TimedOut { attempts } => Err(PlatformError::Processing(format!(
                "media {} still processing after {} STATUS checks",
                media.id, attempts
            ))
            .into()),
        }
    }

    /// Stream the asset into APPEND calls. Returns the number of segments.
    async fn append_all(&self, token: &str, media_id: &str, media: &Media) -> Result<u32> {
        let mut stream = self.storage.open(media).await?;
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let mut segment: u32 = 0;
        let mut received: u64 = 0;

        while let Some(piece) = stream.next().await {
            let piece = piece?;
            received += piece.len() as u64;
            if received > media.size_bytes {
                return Err(size_mismatch(media, received));
            }
            buf.extend_from_slice(&piece);

            while buf.len() >= self.chunk_size {
                let chunk = buf.split_to(self.chunk_size).freeze();
                self.append(token, media_id, segment, chunk).await?;
                segment += 1;
            }
        }

        if received != media.size_bytes {
            return Err(size_mismatch(media, received));
        }

        if !buf.is_empty() {
            self.append(token, media_id, segment, buf.freeze()).await?;
            segment += 1;
        }

        Ok(segment)
    }

    async fn append(&self, token: &str, media_id: &str, segment: u32, chunk: Bytes) -> Result<()> {
        let len = chunk.len();
        self.platform
            .append_chunk(token, media_id, segment, chunk)
            .await?;
        tracing::trace!(media_id, segment, len, "chunk appended");
        Ok(())
    }
}

fn size_mismatch(media: &Media, actual: u64) -> SlotlineError {
    StorageError::SizeMismatch {
        path: media.bucket_path.clone(),
        expected: media.size_bytes,
        actual,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::platforms::mock::{MockCall, MockConfig, MockPlatform};
    use crate::storage::MemoryStorage;

    const MIB: usize = 1024 * 1024;

    fn fast_poll(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    fn media(path: &str, size: usize) -> Media {
        Media {
            id: format!("media-{}", path),
            bucket_path: path.to_string(),
            mime: "image/png".to_string(),
            size_bytes: size as u64,
        }
    }

    fn uploader(platform: &MockPlatform, storage: &MemoryStorage) -> ChunkedUploader {
        ChunkedUploader::new(Arc::new(platform.clone()), Arc::new(storage.clone()))
            .with_poll_policy(fast_poll(20))
    }

    #[tokio::test]
    async fn test_ten_mib_asset_appends_three_chunks() {
        let platform = MockPlatform::success("x");
        let storage = MemoryStorage::default();
        storage.put("big.png", vec![1u8; 10 * MIB]);

        let media_id = uploader(&platform, &storage)
            .upload("tok", &media("big.png", 10 * MIB))
            .await
            .unwrap();

        assert_eq!(media_id, "mock-media-1");
        assert_eq!(
            platform.appended_segments(),
            vec![(0, 4 * MIB), (1, 4 * MIB), (2, 2 * MIB)]
        );
        let calls = platform.calls();
        assert!(matches!(calls.first(), Some(MockCall::Init { total_bytes, .. }) if *total_bytes == (10 * MIB) as u64));
        assert!(matches!(calls.last(), Some(MockCall::Finalize { .. })));
    }

    #[tokio::test]
    async fn test_segments_are_dense_and_sum_to_size() {
        // Odd piece and chunk sizes so chunk boundaries never line up
        for size in [1usize, 6, 7, 8, 50, 99] {
            let platform = MockPlatform::success("x");
            let storage = MemoryStorage::new(3);
            storage.put("a", vec![9u8; size]);

            ChunkedUploader::new(Arc::new(platform.clone()), Arc::new(storage))
                .with_chunk_size(7)
                .with_poll_policy(fast_poll(1))
                .upload("tok", &media("a", size))
                .await
                .unwrap();

            let segments = platform.appended_segments();
            let indices: Vec<u32> = segments.iter().map(|(s, _)| *s).collect();
            let expected: Vec<u32> = (0..size.div_ceil(7) as u32).collect();
            assert_eq!(indices, expected, "size {}", size);
            assert_eq!(segments.iter().map(|(_, l)| l).sum::<usize>(), size);
        }
    }

    #[tokio::test]
    async fn test_append_failure_stops_upload() {
        let platform = MockPlatform::append_failure(1);
        let storage = MemoryStorage::default();
        storage.put("big.png", vec![0u8; 10 * MIB]);

        let err = uploader(&platform, &storage)
            .upload("tok", &media("big.png", 10 * MIB))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("APPEND failed"));
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(platform.appended_segments().len(), 2);
        assert!(!platform
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Finalize { .. })));
    }

    #[tokio::test]
    async fn test_processing_polls_until_succeeded() {
        let platform = MockPlatform::new(MockConfig {
            finalize_state: ProcessingState::InProgress { check_after: None },
            status_script: vec![
                ProcessingState::InProgress {
                    check_after: Some(Duration::from_secs(1)),
                },
                ProcessingState::Succeeded,
            ],
            ..Default::default()
        });
        let storage = MemoryStorage::default();
        storage.put("v.mp4", vec![0u8; 100]);

        let media_id = uploader(&platform, &storage)
            .upload("tok", &media("v.mp4", 100))
            .await
            .unwrap();

        assert_eq!(media_id, "mock-media-1");
        let polls = platform
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Status { .. }))
            .count();
        assert_eq!(polls, 2);
    }

    #[tokio::test]
    async fn test_processing_failed_is_an_error() {
        let platform = MockPlatform::new(MockConfig {
            finalize_state: ProcessingState::InProgress { check_after: None },
            status_fallback: ProcessingState::Failed("InvalidMedia".into()),
            ..Default::default()
        });
        let storage = MemoryStorage::default();
        storage.put("v.mp4", vec![0u8; 100]);

        let err = uploader(&platform, &storage)
            .upload("tok", &media("v.mp4", 100))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SlotlineError::Platform(PlatformError::Processing(_))
        ));
        assert!(err.to_string().contains("InvalidMedia"));
    }

    #[tokio::test]
    async fn test_polling_gives_up_after_max_attempts() {
        let platform = MockPlatform::new(MockConfig {
            finalize_state: ProcessingState::InProgress { check_after: None },
            status_fallback: ProcessingState::InProgress { check_after: None },
            ..Default::default()
        });

        let outcome = poll_processing(&platform, "tok", "m1", fast_poll(3))
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 3 });
        assert_eq!(platform.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_short_stream_is_size_mismatch() {
        let platform = MockPlatform::success("x");
        let storage = MemoryStorage::default();
        storage.put("a.png", vec![0u8; 5]);

        let err = uploader(&platform, &storage)
            .upload("tok", &media("a.png", 10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SlotlineError::Storage(StorageError::SizeMismatch {
                expected: 10,
                actual: 5,
                ..
            })
        ));
        assert!(platform.appended_segments().is_empty());
    }

    #[tokio::test]
    async fn test_empty_media_rejected_before_init() {
        let platform = MockPlatform::success("x");
        let storage = MemoryStorage::default();

        let err = uploader(&platform, &storage)
            .upload("tok", &media("empty.png", 0))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Input);
        assert!(platform.calls().is_empty());
    }
}
