//! Token lifecycle manager
//!
//! Makes sure a usable bearer token exists before any platform call. A
//! refresh for one platform account is a critical section at two levels:
//!
//! - within the process, callers for the same account key queue on an
//!   async mutex and re-read the stored account once they hold it, so only
//!   the first one actually refreshes;
//! - across processes, the rotated tokens are written with a conditional
//!   update keyed on the refresh token that was spent. A worker that loses
//!   that race adopts whatever the winner stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CredentialError, Result};
use crate::platforms::Platform;
use crate::store::Store;
use crate::types::{Account, TokenUpdate};

pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 60;

/// Whether `account` has to be refreshed at `now`
///
/// True only when an expiry is known, it falls within `skew_secs`, and a
/// refresh token exists. Everything else reuses the stored token as is.
pub fn needs_refresh(account: &Account, now: i64, skew_secs: i64) -> bool {
    match (account.expires_at, &account.refresh_token) {
        (Some(expires_at), Some(_)) => expires_at - now < skew_secs,
        _ => false,
    }
}

pub struct TokenManager {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    skew_secs: i64,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn Store>, platform: Arc<dyn Platform>, skew_secs: i64) -> Self {
        Self {
            store,
            platform,
            skew_secs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Load the stored account for this manager's platform and make it valid
    ///
    /// # Errors
    ///
    /// `CredentialError::NotConnected` when no account row exists
    pub async fn current(&self, now: i64) -> Result<Account> {
        let platform = self.platform.name();
        let account = self
            .store
            .get_account(platform)
            .await?
            .ok_or_else(|| CredentialError::NotConnected(platform.to_string()))?;

        self.ensure_valid(account, now).await
    }

    /// Return `account` unchanged if its token is still good (or cannot be
    /// refreshed), otherwise refresh, persist, and return the rotated record.
    pub async fn ensure_valid(&self, account: Account, now: i64) -> Result<Account> {
        if !needs_refresh(&account, now, self.skew_secs) {
            return Ok(account);
        }

        let lock = self.lock_for(&account.platform);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may already have refreshed
        let current = self
            .store
            .get_account(&account.platform)
            .await?
            .ok_or_else(|| CredentialError::NotConnected(account.platform.clone()))?;

        if !needs_refresh(&current, now, self.skew_secs) {
            tracing::debug!(platform = %current.platform, "token already refreshed");
            return Ok(current);
        }

        let Some(spent) = current.refresh_token.clone() else {
            return Ok(current);
        };

        tracing::info!(
            platform = %current.platform,
            expires_at = ?current.expires_at,
            "refreshing access token"
        );

        let grant = self.platform.refresh_token(&spent).await?;
        let update = TokenUpdate {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_in.map(|secs| now + secs),
        };

        let won = self
            .store
            .update_account(&current.platform, Some(&spent), &update, now)
            .await?;

        if !won {
            // Another process rotated first; its tokens are the live ones
            tracing::warn!(
                platform = %current.platform,
                "refresh token rotated concurrently, adopting stored credential"
            );
            return self
                .store
                .get_account(&current.platform)
                .await?
                .ok_or_else(|| CredentialError::NotConnected(current.platform.clone()).into());
        }

        Ok(Account {
            access_token: update.access_token,
            refresh_token: update.refresh_token.or(Some(spent)),
            expires_at: update.expires_at,
            updated_at: now,
            ..current
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlotlineError;
    use crate::platforms::mock::{MockConfig, MockPlatform};
    use crate::platforms::{Identity, ProcessingState, TokenGrant};
    use crate::store::MemoryStore;
    use crate::types::PLATFORM_X;
    use async_trait::async_trait;
    use bytes::Bytes;

    const NOW: i64 = 1_750_000_000;

    fn account(expires_at: Option<i64>, refresh: Option<&str>) -> Account {
        Account {
            platform: PLATFORM_X.to_string(),
            handle: Some("slotline".to_string()),
            access_token: "a1".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at,
            scope: None,
            updated_at: 0,
        }
    }

    fn mock_x() -> MockPlatform {
        MockPlatform::new(MockConfig {
            name: PLATFORM_X.to_string(),
            ..Default::default()
        })
    }

    async fn setup(acct: Account) -> (Arc<MemoryStore>, MockPlatform, TokenManager) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_account(&acct).await.unwrap();
        let platform = mock_x();
        let manager = TokenManager::new(
            store.clone(),
            Arc::new(platform.clone()),
            DEFAULT_REFRESH_SKEW_SECS,
        );
        (store, platform, manager)
    }

    #[test]
    fn test_needs_refresh_truth_table() {
        let skew = DEFAULT_REFRESH_SKEW_SECS;
        assert!(!needs_refresh(&account(None, Some("r")), NOW, skew));
        assert!(!needs_refresh(&account(Some(NOW + 3600), Some("r")), NOW, skew));
        assert!(!needs_refresh(&account(Some(NOW + 60), Some("r")), NOW, skew));
        assert!(needs_refresh(&account(Some(NOW + 59), Some("r")), NOW, skew));
        assert!(needs_refresh(&account(Some(NOW - 10), Some("r")), NOW, skew));
        assert!(!needs_refresh(&account(Some(NOW + 30), None), NOW, skew));
    }

    #[tokio::test]
    async fn test_valid_token_is_reused() {
        let acct = account(Some(NOW + 3600), Some("r1"));
        let (_, platform, manager) = setup(acct.clone()).await;

        let result = manager.ensure_valid(acct.clone(), NOW).await.unwrap();
        assert_eq!(result, acct);
        assert_eq!(platform.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_expiring_without_refresh_token_is_best_effort() {
        let acct = account(Some(NOW + 30), None);
        let (_, platform, manager) = setup(acct.clone()).await;

        let result = manager.ensure_valid(acct.clone(), NOW).await.unwrap();
        assert_eq!(result.access_token, "a1");
        assert_eq!(platform.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let acct = account(Some(NOW + 30), Some("r1"));
        let (store, platform, manager) = setup(acct.clone()).await;

        let result = manager.ensure_valid(acct, NOW).await.unwrap();
        assert_eq!(platform.refresh_count(), 1);
        assert_eq!(result.access_token, "mock-access-refreshed");
        assert_eq!(result.refresh_token.as_deref(), Some("mock-refresh-rotated"));
        assert_eq!(result.expires_at, Some(NOW + 7200));

        let stored = store.get_account(PLATFORM_X).await.unwrap().unwrap();
        assert_eq!(stored, result);
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_old_refresh_token() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(&account(Some(NOW), Some("r1")))
            .await
            .unwrap();
        let platform = MockPlatform::new(MockConfig {
            name: PLATFORM_X.to_string(),
            refresh_grant: Some(TokenGrant {
                access_token: "a2".to_string(),
                refresh_token: None,
                expires_in: None,
            }),
            ..Default::default()
        });
        let manager = TokenManager::new(store.clone(), Arc::new(platform), 60);

        let result = manager.current(NOW).await.unwrap();
        assert_eq!(result.access_token, "a2");
        assert_eq!(result.refresh_token.as_deref(), Some("r1"));
        assert_eq!(result.expires_at, None);
        assert_eq!(store.get_account(PLATFORM_X).await.unwrap().unwrap(), result);
    }

    #[tokio::test]
    async fn test_concurrent_callers_refresh_once() {
        let acct = account(Some(NOW + 10), Some("r1"));
        let (_, platform, manager) = setup(acct.clone()).await;
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            let acct = acct.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_valid(acct, NOW).await.unwrap()
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.access_token, "mock-access-refreshed");
        }
        assert_eq!(platform.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_account_is_not_connected() {
        let store = Arc::new(MemoryStore::new());
        let manager = TokenManager::new(store, Arc::new(mock_x()), 60);

        let err = manager.current(NOW).await.unwrap_err();
        assert!(matches!(
            err,
            SlotlineError::Credential(CredentialError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_credential_error() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(&account(Some(NOW), Some("r1")))
            .await
            .unwrap();
        let platform = MockPlatform::new(MockConfig {
            name: PLATFORM_X.to_string(),
            refresh_grant: None,
            ..Default::default()
        });
        let manager = TokenManager::new(store.clone(), Arc::new(platform), 60);

        let err = manager.current(NOW).await.unwrap_err();
        assert!(matches!(
            err,
            SlotlineError::Credential(CredentialError::RefreshFailed(_))
        ));
        // Nothing was written
        assert_eq!(
            store.get_account(PLATFORM_X).await.unwrap().unwrap().access_token,
            "a1"
        );
    }

    /// Platform whose refresh lets a second process rotate the credential
    /// before the first one persists
    struct RacingPlatform {
        inner: MockPlatform,
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl Platform for RacingPlatform {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
            let other = TokenUpdate {
                access_token: "from-other-process".to_string(),
                refresh_token: Some("r-other".to_string()),
                expires_at: Some(NOW + 7200),
            };
            self.store
                .update_account(PLATFORM_X, Some(refresh_token), &other, NOW)
                .await?;
            self.inner.refresh_token(refresh_token).await
        }

        async fn init_upload(&self, t: &str, n: u64, m: &str) -> Result<String> {
            self.inner.init_upload(t, n, m).await
        }

        async fn append_chunk(&self, t: &str, id: &str, s: u32, c: Bytes) -> Result<()> {
            self.inner.append_chunk(t, id, s, c).await
        }

        async fn finalize_upload(&self, t: &str, id: &str) -> Result<ProcessingState> {
            self.inner.finalize_upload(t, id).await
        }

        async fn upload_status(&self, t: &str, id: &str) -> Result<ProcessingState> {
            self.inner.upload_status(t, id).await
        }

        async fn create_post(
            &self,
            t: &str,
            text: &str,
            media: &[String],
            reply: Option<&str>,
        ) -> Result<String> {
            self.inner.create_post(t, text, media, reply).await
        }

        async fn whoami(&self, t: &str) -> Result<Identity> {
            self.inner.whoami(t).await
        }
    }

    #[tokio::test]
    async fn test_losing_cross_process_race_adopts_stored_credential() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(&account(Some(NOW), Some("r1")))
            .await
            .unwrap();
        let platform = RacingPlatform {
            inner: mock_x(),
            store: store.clone(),
        };
        let manager = TokenManager::new(store.clone(), Arc::new(platform), 60);

        let result = manager.current(NOW).await.unwrap();
        assert_eq!(result.access_token, "from-other-process");
        assert_eq!(result.refresh_token.as_deref(), Some("r-other"));
    }
}
