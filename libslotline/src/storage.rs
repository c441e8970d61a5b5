//! Object storage collaborator
//!
//! Media bytes live in a bucket outside the relational store. The pipeline
//! asks storage for a short-lived signed URL per [`Media`] row and streams
//! the object from it, so an asset is never fully buffered in memory.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::StorageConfig;
use crate::error::{Result, SlotlineError, StorageError};
use crate::types::Media;

/// Stream of object bytes in whatever piece sizes the backend produces
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Time-limited download URL for `bucket_path`
    async fn signed_url(&self, bucket_path: &str) -> Result<String>;

    /// Stream the bytes of `media`
    async fn open(&self, media: &Media) -> Result<ByteStream>;
}

/// Supabase Storage over its REST API
pub struct SupabaseStorage {
    http: Client,
    base_url: String,
    bucket: String,
    service_key: String,
    ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SupabaseStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let service_key = config.service_key()?;
        Self::with_key(config.url()?, config, service_key)
    }

    /// A stalled download fails after `read_timeout_secs` without new bytes
    /// instead of holding its job in `running`.
    pub fn with_key(base_url: &str, config: &StorageConfig, service_key: String) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| StorageError::Download(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            service_key,
            ttl_secs: config.signed_url_ttl_secs,
        })
    }
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    async fn signed_url(&self, bucket_path: &str) -> Result<String> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url,
            self.bucket,
            bucket_path.trim_start_matches('/')
        );
        let sign_error = |reason: String| StorageError::Sign {
            path: bucket_path.to_string(),
            reason,
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({ "expiresIn": self.ttl_secs }))
            .send()
            .await
            .map_err(|e| sign_error(e.to_string()))?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(StorageError::NotFound(bucket_path.into()).into()),
            status => {
                let body = resp.text().await.unwrap_or_default();
                return Err(sign_error(format!("status {}: {}", status, body)).into());
            }
        }

        let signed: SignResponse = resp
            .json()
            .await
            .map_err(|e| sign_error(e.to_string()))?;

        // signedURL is relative to the storage API root
        Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
    }

    async fn open(&self, media: &Media) -> Result<ByteStream> {
        let url = self.signed_url(&media.bucket_path).await?;

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::NotFound(media.bucket_path.clone()).into())
            }
            status => {
                return Err(StorageError::Download(format!(
                    "{}: status {}",
                    media.bucket_path, status
                ))
                .into())
            }
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SlotlineError::from(StorageError::Download(e.to_string()))))
            .boxed())
    }
}

/// In-process storage for tests and dry runs
///
/// Objects are streamed back in `piece_size` pieces so consumers see the
/// same uneven framing a network download would give them.
#[derive(Clone)]
pub struct MemoryStorage {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    piece_size: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl MemoryStorage {
    pub fn new(piece_size: usize) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            piece_size: piece_size.max(1),
        }
    }

    pub fn put(&self, bucket_path: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bucket_path.to_string(), data.into());
    }

    fn get(&self, bucket_path: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket_path)
            .cloned()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn signed_url(&self, bucket_path: &str) -> Result<String> {
        if self.get(bucket_path).is_none() {
            return Err(StorageError::NotFound(bucket_path.to_string()).into());
        }
        Ok(format!("memory://{}", bucket_path))
    }

    async fn open(&self, media: &Media) -> Result<ByteStream> {
        let data = self
            .get(&media.bucket_path)
            .ok_or_else(|| StorageError::NotFound(media.bucket_path.clone()))?;

        let piece_size = self.piece_size;
        let pieces: Vec<Result<Bytes>> = (0..data.len())
            .step_by(piece_size)
            .map(|start| Ok(data.slice(start..(start + piece_size).min(data.len()))))
            .collect();

        Ok(stream::iter(pieces).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mockito::Server;
    use std::io::Write;

    fn media(path: &str, size: u64) -> Media {
        Media {
            id: "m1".to_string(),
            bucket_path: path.to_string(),
            mime: "image/png".to_string(),
            size_bytes: size,
        }
    }

    fn config() -> StorageConfig {
        StorageConfig {
            bucket: "slotline-media".to_string(),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_memory_storage_streams_in_pieces() {
        let storage = MemoryStorage::new(4);
        storage.put("u/a.png", vec![7u8; 10]);

        let pieces: Vec<Bytes> = storage
            .open(&media("u/a.png", 10))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            pieces.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[tokio::test]
    async fn test_memory_storage_missing_object() {
        let storage = MemoryStorage::default();
        let result = storage.open(&media("nope.png", 1)).await;
        assert!(matches!(
            result,
            Err(SlotlineError::Storage(StorageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_supabase_signs_then_downloads() {
        let mut server = Server::new_async().await;
        let sign = server
            .mock("POST", "/storage/v1/object/sign/slotline-media/u/1/a.png")
            .match_header("authorization", "Bearer service-key")
            .match_body(mockito::Matcher::Json(serde_json::json!({ "expiresIn": 60 })))
            .with_status(200)
            .with_body(r#"{"signedURL":"/object/sign/slotline-media/u/1/a.png?token=abc"}"#)
            .create_async()
            .await;
        let download = server
            .mock("GET", "/storage/v1/object/sign/slotline-media/u/1/a.png")
            .match_query(mockito::Matcher::UrlEncoded("token".into(), "abc".into()))
            .with_status(200)
            .with_body("PNGDATA")
            .create_async()
            .await;

        let storage =
            SupabaseStorage::with_key(&server.url(), &config(), "service-key".into()).unwrap();
        let bytes: Vec<Bytes> = storage
            .open(&media("u/1/a.png", 7))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        sign.assert_async().await;
        download.assert_async().await;
        assert_eq!(bytes.concat(), b"PNGDATA".to_vec());
    }

    #[tokio::test]
    async fn test_supabase_sign_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/storage/v1/object/sign/slotline-media/missing.png")
            .with_status(400)
            .with_body(r#"{"error":"InvalidJWT"}"#)
            .create_async()
            .await;

        let storage = SupabaseStorage::with_key(&server.url(), &config(), "bad".into()).unwrap();
        let err = storage.signed_url("missing.png").await.unwrap_err();
        assert!(matches!(
            err,
            SlotlineError::Storage(StorageError::Sign { .. })
        ));
        assert!(err.to_string().contains("InvalidJWT"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supabase_stalled_download_times_out() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/storage/v1/object/sign/slotline-media/u/1/slow.png")
            .with_status(200)
            .with_body(r#"{"signedURL":"/object/sign/slotline-media/u/1/slow.png?token=abc"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/storage/v1/object/sign/slotline-media/u/1/slow.png")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_chunked_body(|w| {
                w.write_all(b"PN")?;
                std::thread::sleep(Duration::from_secs(5));
                w.write_all(b"GDATA")
            })
            .create_async()
            .await;

        let mut config = config();
        config.read_timeout_secs = 1;
        let storage =
            SupabaseStorage::with_key(&server.url(), &config, "service-key".into()).unwrap();

        let download = async {
            let stream = storage.open(&media("u/1/slow.png", 7)).await?;
            stream.try_collect::<Vec<Bytes>>().await
        };
        let result = tokio::time::timeout(Duration::from_secs(4), download)
            .await
            .expect("read timeout should fire before the stall ends");

        assert!(matches!(
            result,
            Err(SlotlineError::Storage(StorageError::Download(_)))
        ));
    }
}
