//! Thread publisher
//!
//! Turns an ordered list of items into a reply chain on the platform. All
//! media of the thread is uploaded before the first post goes out, so an
//! upload failure never leaves a truncated thread behind. Once posting has
//! started, a failure on item k stops the chain: items after k are never
//! attempted and the error reports how many items are already live.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SlotlineError};
use crate::platforms::Platform;
use crate::store::Store;
use crate::types::{Media, PostItem, PostRecord};
use crate::upload::ChunkedUploader;

/// Check that `items` is non-empty and its `idx` values are exactly
/// `0..n-1` in order.
pub fn validate_items(post_id: &str, items: &[PostItem]) -> Result<()> {
    if items.is_empty() {
        return Err(SlotlineError::InvalidInput(format!(
            "post {} has no items",
            post_id
        )));
    }

    for (expected, item) in items.iter().enumerate() {
        if item.idx != expected as i64 {
            return Err(SlotlineError::InvalidInput(format!(
                "post {} items are not contiguous: expected idx {}, found {}",
                post_id, expected, item.idx
            )));
        }
    }

    Ok(())
}

pub struct ThreadPublisher {
    platform: Arc<dyn Platform>,
    uploader: ChunkedUploader,
    store: Arc<dyn Store>,
}

impl ThreadPublisher {
    pub fn new(platform: Arc<dyn Platform>, uploader: ChunkedUploader, store: Arc<dyn Store>) -> Self {
        Self {
            platform,
            uploader,
            store,
        }
    }

    /// Publish `items` (sorted by idx) as a reply chain.
    ///
    /// `media` holds every media row the items reference, keyed by id.
    /// Returns the platform post ids in idx order.
    ///
    /// # Errors
    ///
    /// - `SlotlineError::InvalidInput` if an item references unknown media
    /// - the upload or post error itself if nothing was posted yet
    /// - `SlotlineError::PartialThread` once at least one item is live
    pub async fn publish(
        &self,
        token: &str,
        post_id: &str,
        items: &[PostItem],
        media: &HashMap<String, Media>,
        now: i64,
    ) -> Result<Vec<String>> {
        validate_items(post_id, items)?;

        let references = self.upload_media(token, items, media).await?;

        let total = items.len();
        let mut posted: Vec<String> = Vec::with_capacity(total);

        for (item, media_refs) in items.iter().zip(&references) {
            let parent = posted.last().cloned();

            let platform_id = match self
                .platform
                .create_post(token, &item.text, media_refs, parent.as_deref())
                .await
            {
                Ok(id) => id,
                Err(e) => return Err(truncated(posted.len(), total, e)),
            };

            tracing::info!(
                post_id,
                idx = item.idx,
                platform_id = %platform_id,
                in_reply_to = ?parent,
                "item posted"
            );
            posted.push(platform_id.clone());

            let record = PostRecord {
                id: None,
                post_id: post_id.to_string(),
                idx: item.idx,
                platform: self.platform.name().to_string(),
                platform_post_id: platform_id,
                in_reply_to: parent,
                posted_at: now,
            };
            if let Err(e) = self.store.record_post(&record).await {
                return Err(truncated(posted.len(), total, e));
            }
        }

        Ok(posted)
    }

    /// Upload every asset the thread references, in item then media order.
    /// An asset referenced twice is uploaded once.
    async fn upload_media(
        &self,
        token: &str,
        items: &[PostItem],
        media: &HashMap<String, Media>,
    ) -> Result<Vec<Vec<String>>> {
        let mut uploaded: HashMap<&str, String> = HashMap::new();
        let mut references = Vec::with_capacity(items.len());

        for item in items {
            let mut refs = Vec::with_capacity(item.media_ids.len());
            for media_id in &item.media_ids {
                if let Some(existing) = uploaded.get(media_id.as_str()) {
                    refs.push(existing.clone());
                    continue;
                }

                let row = media.get(media_id).ok_or_else(|| {
                    SlotlineError::InvalidInput(format!(
                        "item {} references missing media {}",
                        item.idx, media_id
                    ))
                })?;

                let reference = self.uploader.upload(token, row).await?;
                uploaded.insert(media_id.as_str(), reference.clone());
                refs.push(reference);
            }
            references.push(refs);
        }

        Ok(references)
    }
}

/// Wrap `error` as a partial-thread failure when some items are already live
fn truncated(posted: usize, total: usize, error: SlotlineError) -> SlotlineError {
    if posted == 0 {
        return error;
    }
    SlotlineError::PartialThread {
        posted,
        total,
        source: Box::new(error),
    }
}
