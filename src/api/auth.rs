// LoanFetch - Library Loan Downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Session identity and credential storage
//!
//! The session API identifies a device by a "chip": a device id plus a
//! bearer token (a JWT). Linking a chip to a library account happens once,
//! with an 8 digit setup code; afterwards the stored identity is reused and
//! refreshed by re-issuing the chip with the current bearer.
//!
//! # Refresh serialization
//! All refreshes go through [`CredentialStore`], which holds its mutex for the
//! whole refresh. Concurrent callers that find an expired identity queue on
//! the mutex; the first performs the network refresh, the rest observe the
//! fresh identity and return it without calling the service again.
//!
//! # Example
//! ```rust,no_run
//! use loanfetch::api::auth::CredentialStore;
//! use std::path::Path;
//!
//! # async fn example() -> loanfetch::error::Result<()> {
//! let store = CredentialStore::open(Path::new("./settings")).await?;
//! if let Some(identity) = store.current().await {
//!     println!("{}", identity.masked_log_entry());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{LoanError, Result};
use crate::file::manager::FileManager;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// File name of the persisted identity inside the settings directory
pub const IDENTITY_FILE_NAME: &str = "identity.json";

/// Refresh this long before the bearer actually expires
const REFRESH_BUFFER_MINUTES: i64 = 5;

/// Bearer credential with its expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Build from a JWT, reading expiry from its `exp` claim
    ///
    /// Tokens that are not JWTs, or carry no `exp`, expire after
    /// `fallback_lifetime`.
    pub fn from_jwt(token: String, fallback_lifetime: Duration) -> Self {
        let expires_at = jwt_expiry(&token).unwrap_or_else(|| Utc::now() + fallback_lifetime);
        Self { token, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Persisted session identity
///
/// Unknown fields in the stored file are ignored so newer files stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Device ("chip") identifier
    pub device_id: String,
    pub access_token: AccessToken,
    /// Credential used to re-issue the chip
    pub refresh_token: String,
    /// Set once a setup code has been confirmed
    #[serde(default)]
    pub linked_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Build from a `/chip` response body
    pub fn from_chip(chip: &ChipResponse, lifetime: Duration) -> Self {
        Self {
            device_id: chip.chip.clone(),
            access_token: AccessToken::from_jwt(chip.identity.clone(), lifetime),
            refresh_token: chip.identity.clone(),
            linked_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.access_token.is_expired()
    }

    /// Expired or expiring within the refresh buffer
    pub fn needs_token_refresh(&self) -> bool {
        let buffer = Duration::minutes(REFRESH_BUFFER_MINUTES);
        self.access_token.expires_at <= Utc::now() + buffer
    }

    pub fn is_linked(&self) -> bool {
        self.linked_at.is_some()
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.access_token.expires_at - Utc::now()
    }

    /// Identity summary safe for logs
    pub fn masked_log_entry(&self) -> String {
        format!(
            "DeviceId={}|Token={}|Expires={}",
            Self::mask(&self.device_id),
            Self::mask(&self.access_token.token),
            self.access_token.expires_at.to_rfc3339()
        )
    }

    /// Shows first 2 and last 2 characters, replaces middle with asterisks
    fn mask(s: &str) -> String {
        let chars: Vec<char> = s.chars().collect();
        if chars.is_empty() {
            "[empty]".to_string()
        } else if chars.len() <= 4 {
            "****".to_string()
        } else {
            let first_two: String = chars.iter().take(2).collect();
            let last_two: String = chars.iter().skip(chars.len() - 2).collect();
            format!("{}{}{}", first_two, "*".repeat(chars.len() - 4), last_two)
        }
    }
}

/// Body of `POST /chip`
#[derive(Debug, Clone, Deserialize)]
pub struct ChipResponse {
    pub identity: String,
    pub chip: String,
}

/// Performs the network side of a credential refresh
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, identity: &Identity) -> Result<Identity>;
}

/// Process-wide owner of the session identity
#[derive(Debug)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    current: Mutex<Option<Identity>>,
}

impl CredentialStore {
    /// Open the store in `settings_dir`, loading any saved identity
    pub async fn open(settings_dir: &Path) -> Result<Self> {
        let path = settings_dir.join(IDENTITY_FILE_NAME);
        let current = if FileManager::file_exists(&path).await {
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Identity>(&raw) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable identity file");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            path: Some(path),
            current: Mutex::new(current),
        })
    }

    /// Store that never touches disk
    pub fn in_memory(identity: Option<Identity>) -> Self {
        Self {
            path: None,
            current: Mutex::new(identity),
        }
    }

    pub async fn current(&self) -> Option<Identity> {
        self.current.lock().await.clone()
    }

    /// Replace the identity and persist it
    pub async fn store(&self, identity: Identity) -> Result<()> {
        let mut guard = self.current.lock().await;
        self.persist(&identity).await?;
        *guard = Some(identity);
        Ok(())
    }

    /// Forget the identity, deleting the stored file
    pub async fn reset(&self) -> Result<()> {
        let mut guard = self.current.lock().await;
        if let Some(ref path) = self.path {
            FileManager::safe_delete(path).await?;
        }
        *guard = None;
        tracing::info!("stored identity cleared");
        Ok(())
    }

    /// Current identity, refreshed first if it is about to expire
    pub async fn valid_identity(&self, refresher: &dyn TokenRefresher) -> Result<Identity> {
        let mut guard = self.current.lock().await;
        let identity = guard.clone().ok_or(LoanError::SetupCodeRequired)?;

        if !identity.needs_token_refresh() {
            return Ok(identity);
        }

        let refreshed = self.refresh_locked(&identity, refresher).await?;
        *guard = Some(refreshed.clone());
        Ok(refreshed)
    }

    /// Refresh after the service rejected `stale_token`
    ///
    /// If another caller already replaced that token, its result is returned
    /// and no second refresh happens.
    pub async fn force_refresh(&self, stale_token: &str, refresher: &dyn TokenRefresher) -> Result<Identity> {
        let mut guard = self.current.lock().await;
        let identity = guard.clone().ok_or(LoanError::SetupCodeRequired)?;

        if identity.access_token.token != stale_token {
            tracing::debug!("credential already refreshed by a concurrent caller");
            return Ok(identity);
        }

        let refreshed = self.refresh_locked(&identity, refresher).await?;
        *guard = Some(refreshed.clone());
        Ok(refreshed)
    }

    async fn refresh_locked(&self, identity: &Identity, refresher: &dyn TokenRefresher) -> Result<Identity> {
        tracing::info!(identity = %identity.masked_log_entry(), "refreshing session credential");

        let mut refreshed = refresher.refresh(identity).await.map_err(|e| match e {
            LoanError::AuthExpiredAndRefreshFailed(_) => e,
            other => LoanError::AuthExpiredAndRefreshFailed(other.to_string()),
        })?;
        if refreshed.linked_at.is_none() {
            refreshed.linked_at = identity.linked_at;
        }

        self.persist(&refreshed).await?;
        Ok(refreshed)
    }

    async fn persist(&self, identity: &Identity) -> Result<()> {
        if let Some(ref path) = self.path {
            let json = serde_json::to_vec_pretty(identity)?;
            FileManager::atomic_write(path, &json).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn identity(token: &str, expires_in: Duration) -> Identity {
        Identity {
            device_id: "chip-1".to_string(),
            access_token: AccessToken {
                token: token.to_string(),
                expires_at: Utc::now() + expires_in,
            },
            refresh_token: token.to_string(),
            linked_at: Some(Utc::now()),
        }
    }

    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, current: &Identity) -> Result<Identity> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail {
                return Err(LoanError::api_failed("denied", Some(401), None));
            }
            let mut next = identity(&format!("token-{}", n), Duration::hours(1));
            next.device_id = current.device_id.clone();
            next.linked_at = None;
            Ok(next)
        }
    }

    #[test]
    fn test_jwt_expiry_is_read_from_claims() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":1900000000}"#);
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload);
        let access = AccessToken::from_jwt(token, Duration::hours(1));
        assert_eq!(access.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_opaque_token_uses_fallback_lifetime() {
        let access = AccessToken::from_jwt("opaque".to_string(), Duration::hours(2));
        assert!(access.expires_at > Utc::now() + Duration::minutes(119));
    }

    #[test]
    fn test_needs_refresh_within_buffer() {
        assert!(identity("t", Duration::minutes(2)).needs_token_refresh());
        assert!(!identity("t", Duration::hours(1)).needs_token_refresh());
    }

    #[test]
    fn test_masked_log_entry_hides_token() {
        let entry = identity("abcdefghij", Duration::hours(1)).masked_log_entry();
        assert!(entry.contains("ab******ij"));
        assert!(!entry.contains("abcdefghij"));
    }

    #[tokio::test]
    async fn test_identity_persists_and_tolerates_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open(dir.path()).await.unwrap();
        assert!(store.current().await.is_none());

        store.store(identity("stored", Duration::hours(1))).await.unwrap();

        let path = dir.path().join(IDENTITY_FILE_NAME);
        let mut value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["added_later"] = serde_json::json!({"x": 1});
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let reopened = CredentialStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.current().await.unwrap().access_token.token, "stored");

        reopened.reset().await.unwrap();
        assert!(!path.exists());
        assert!(reopened.current().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_happens_once() {
        let store = Arc::new(CredentialStore::in_memory(Some(identity("old", Duration::minutes(-1)))));
        let refresher = Arc::new(CountingRefresher { calls: AtomicUsize::new(0), fail: false });

        let (a, b) = tokio::join!(
            {
                let store = Arc::clone(&store);
                let refresher = Arc::clone(&refresher);
                async move { store.valid_identity(refresher.as_ref()).await }
            },
            {
                let store = Arc::clone(&store);
                let refresher = Arc::clone(&refresher);
                async move { store.force_refresh("old", refresher.as_ref()).await }
            }
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(a.access_token.token, "token-1");
        assert!(a.is_linked(), "link timestamp survives a refresh");
    }

    #[tokio::test]
    async fn test_refresh_failure_maps_to_auth_error() {
        let store = CredentialStore::in_memory(Some(identity("old", Duration::minutes(-1))));
        let refresher = CountingRefresher { calls: AtomicUsize::new(0), fail: true };

        let err = store.valid_identity(&refresher).await.unwrap_err();
        assert!(matches!(err, LoanError::AuthExpiredAndRefreshFailed(_)));
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_missing_identity_requires_setup_code() {
        let store = CredentialStore::in_memory(None);
        let refresher = CountingRefresher { calls: AtomicUsize::new(0), fail: false };
        let err = store.valid_identity(&refresher).await.unwrap_err();
        assert!(matches!(err, LoanError::SetupCodeRequired));
    }
}
