//! # Partner Token Store
//!
//! Keeps one partner access token shared by every storewatch process and
//! refreshes it under a cross-process lease.
//!
//! ## Refresh Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Token Refresh Protocol                             │
//! │                                                                         │
//! │  get_valid_token()                                                      │
//! │     │                                                                   │
//! │     ├── shared token valid past margin? ──────────────► return it       │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  try_acquire("partner:token:refresh")                                   │
//! │     │                                                                   │
//! │     ├── acquired (heartbeat renews the lease until step 4)              │
//! │     │     1. re-read shared token (a peer may have refreshed)           │
//! │     │     2. POST refresh_token (or get_token) with signed headers      │
//! │     │     3. store token + expiry in the shared cache store             │
//! │     │     4. release lease                                              │
//! │     │                                                                   │
//! │     └── held elsewhere                                                  │
//! │           poll the shared token until it is valid or the wait bound     │
//! │           elapses (then AuthError); never a second refresh call         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Signing
//! Auth calls carry `hex(HMAC-SHA256(secret, app_key + timestamp))` in the
//! token header. The raw secret never leaves the process.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::PartnerSettings;
use crate::error::{SyncError, SyncResult};
use crate::lease::{new_holder_id, LeaseGuard, LeaseStore};
use crate::partner::{endpoint, partner_request, read_envelope};

/// Shared cache key holding the current token.
pub const TOKEN_CACHE_KEY: &str = "partner:token";

/// Lease guarding the refresh call.
pub const REFRESH_LEASE_NAME: &str = "partner:token:refresh";

const REFRESH_POLL_INTERVAL: Duration = Duration::from_millis(100);

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Token
// =============================================================================

/// A partner access token with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// True when the token expires within `margin`.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::milliseconds(margin.as_millis() as i64);
        Utc::now() + margin >= self.expires_at
    }

    /// True when the token is past its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Seconds until expiry, zero if expired.
    pub fn remaining_secs(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}

/// Token payload inside the auth response envelope.
#[derive(Debug, Deserialize)]
struct TokenData {
    #[serde(alias = "accessToken", alias = "token")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(alias = "expiresIn", alias = "expire")]
    expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    app_key: &'a str,
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

/// Signs `app_key + timestamp` with the partner secret.
pub fn sign(secret: &str, app_key: &str, timestamp: &str) -> SyncResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::InvalidConfig(format!("unusable partner secret: {e}")))?;
    mac.update(app_key.as_bytes());
    mac.update(timestamp.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// =============================================================================
// TokenStore
// =============================================================================

/// Shared, lease-guarded partner token.
pub struct TokenStore {
    http: reqwest::Client,
    settings: PartnerSettings,
    cache: Arc<dyn CacheStore>,
    leases: Arc<dyn LeaseStore>,
}

impl TokenStore {
    pub fn new(
        http: reqwest::Client,
        settings: PartnerSettings,
        cache: Arc<dyn CacheStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        TokenStore {
            http,
            settings,
            cache,
            leases,
        }
    }

    fn margin(&self) -> Duration {
        self.settings.token_margin()
    }

    /// Returns a token valid for at least the safety margin.
    pub async fn get_valid_token(&self) -> SyncResult<Token> {
        if let Some(token) = self.shared_token().await? {
            if !token.needs_refresh(self.margin()) {
                debug!(remaining_secs = token.remaining_secs(), "Using shared token");
                return Ok(token);
            }
        }

        self.refresh(None).await
    }

    /// Refreshes because `stale` was rejected.
    ///
    /// If the shared token already differs from `stale`, a peer refreshed it
    /// and that token is returned without another call.
    pub async fn force_refresh(&self, stale: &str) -> SyncResult<Token> {
        self.refresh(Some(stale)).await
    }

    /// Drops the shared token.
    pub async fn invalidate(&self) -> SyncResult<()> {
        self.cache.delete(TOKEN_CACHE_KEY).await?;
        info!("Partner token invalidated");
        Ok(())
    }

    /// Shared token without triggering a refresh.
    pub async fn shared_token(&self) -> SyncResult<Option<Token>> {
        let Some(raw) = self.cache.get(TOKEN_CACHE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable shared token");
                Ok(None)
            }
        }
    }

    fn usable(&self, token: &Token, stale: Option<&str>) -> bool {
        !token.needs_refresh(self.margin()) && stale != Some(token.access_token.as_str())
    }

    async fn refresh(&self, stale: Option<&str>) -> SyncResult<Token> {
        let holder = new_holder_id("token");
        let lease_ttl = self.settings.refresh_lease_ttl();
        let deadline = Instant::now() + self.settings.refresh_wait();

        loop {
            let lease = LeaseGuard::try_acquire(
                Arc::clone(&self.leases),
                REFRESH_LEASE_NAME,
                holder.as_str(),
                lease_ttl,
            )
            .await?;

            if let Some(guard) = lease {
                let lost = CancellationToken::new();
                let heartbeat = guard.start_heartbeat(lost.clone());
                let result = tokio::select! {
                    result = self.refresh_holding_lease(stale) => result,
                    _ = lost.cancelled() => Err(SyncError::Auth(
                        "token refresh lease lost before the refresh finished".into(),
                    )),
                };
                heartbeat.stop().await;
                guard.release().await;
                return result;
            }

            debug!("Token refresh in progress elsewhere, waiting");
            tokio::time::sleep(REFRESH_POLL_INTERVAL).await;

            if let Some(token) = self.shared_token().await? {
                if self.usable(&token, stale) {
                    return Ok(token);
                }
            }

            if Instant::now() >= deadline {
                return Err(SyncError::Auth(
                    "token refresh by another holder did not finish in time".into(),
                ));
            }
        }
    }

    async fn refresh_holding_lease(&self, stale: Option<&str>) -> SyncResult<Token> {
        let current = self.shared_token().await?;
        if let Some(token) = &current {
            if self.usable(token, stale) {
                debug!("Token already refreshed by a peer");
                return Ok(token.clone());
            }
        }

        let refresh_token = current
            .as_ref()
            .filter(|t| !t.is_expired())
            .and_then(|t| t.refresh_token.clone());

        let started = Instant::now();
        let token = self.exchange(refresh_token.as_deref()).await?;
        self.store_token(&token).await?;

        info!(
            expires_in_secs = token.remaining_secs(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Partner token refreshed"
        );
        Ok(token)
    }

    /// Refresh-token exchange, falling back once to a full credential exchange.
    async fn exchange(&self, refresh_token: Option<&str>) -> SyncResult<Token> {
        if let Some(refresh_token) = refresh_token {
            match self
                .call_with_retry(&self.settings.refresh_token_path, Some(refresh_token))
                .await
            {
                Ok(token) => return Ok(token),
                Err(SyncError::Auth(reason)) => {
                    warn!(%reason, "Refresh token rejected, requesting a new token");
                }
                Err(e) => return Err(e),
            }
        }

        self.call_with_retry(&self.settings.get_token_path, None)
            .await
    }

    async fn call_with_retry(&self, path: &str, refresh_token: Option<&str>) -> SyncResult<Token> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.settings.auth_retry_max_secs)),
            ..Default::default()
        };
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.call_token_endpoint(path, refresh_token).await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_retryable() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(attempt, ?delay, error = %e, "Token endpoint unavailable, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(SyncError::Auth(format!(
                            "token endpoint unreachable after {attempt} attempts: {e}"
                        )))
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_token_endpoint(
        &self,
        path: &str,
        refresh_token: Option<&str>,
    ) -> SyncResult<Token> {
        let url = endpoint(&self.settings.base_url, path)?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign(&self.settings.secret, &self.settings.app_key, &timestamp)?;

        let body = TokenRequest {
            app_key: &self.settings.app_key,
            grant_type: &self.settings.grant_type,
            refresh_token,
        };

        let response = partner_request(
            &self.http,
            reqwest::Method::POST,
            url,
            &self.settings,
            &signature,
            &timestamp,
        )
        .json(&body)
        .send()
        .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!("credentials rejected ({status}): {body}")));
        }

        let data: TokenData = match read_envelope(response).await {
            Ok(data) => data,
            Err(SyncError::HttpStatus { status, message }) if status < 500 => {
                return Err(SyncError::Auth(format!("token request refused ({status}): {message}")))
            }
            Err(e) => return Err(e),
        };

        Ok(Token {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(data.expires_in),
        })
    }

    async fn store_token(&self, token: &Token) -> SyncResult<()> {
        let ttl = Duration::from_secs(token.remaining_secs().max(1));
        let raw = serde_json::to_string(token)?;
        self.cache.set(TOKEN_CACHE_KEY, None, &raw, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCacheStore;
    use crate::lease::SqliteLeaseStore;
    use serde_json::json;
    use storewatch_db::{Database, DbConfig};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn token_store(server: &MockServer) -> Arc<TokenStore> {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = PartnerSettings {
            base_url: server.uri(),
            corporation_id: "C100".into(),
            app_key: "storewatch".into(),
            secret: "s3cr3t".into(),
            auth_retry_max_secs: 1,
            ..Default::default()
        };
        Arc::new(TokenStore::new(
            reqwest::Client::new(),
            settings,
            Arc::new(SqliteCacheStore::new(db.cache())),
            Arc::new(SqliteLeaseStore::new(db.leases())),
        ))
    }

    fn token_body(token: &str) -> serde_json::Value {
        json!({
            "code": 0,
            "message": "ok",
            "data": { "accessToken": token, "refreshToken": "r-1", "expiresIn": 7200 }
        })
    }

    #[test]
    fn test_token_needs_refresh() {
        let token = Token {
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };

        // 60s left with a 120s margin
        assert!(token.needs_refresh(Duration::from_secs(120)));
        assert!(!token.needs_refresh(Duration::from_secs(10)));
        assert!(!token.is_expired());
    }

    #[test]
    fn test_signature_is_keyed_and_time_dependent() {
        let a = sign("s3cr3t", "storewatch", "1700000000000").unwrap();
        let b = sign("s3cr3t", "storewatch", "1700000000001").unwrap();
        let c = sign("other", "storewatch", "1700000000000").unwrap();

        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(!a.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/get_token"))
            .and(header_exists("Token"))
            .and(header_exists("Timestamp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-1"))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = token_store(&server).await;
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.get_valid_token().await }));
        }

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.access_token, "tok-1");
            assert!(!token.needs_refresh(Duration::from_secs(120)));
        }
    }

    #[tokio::test]
    async fn test_expiring_token_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-2"))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = token_store(&server).await;
        store
            .store_token(&Token {
                access_token: "tok-old".into(),
                refresh_token: Some("r-0".into()),
                expires_at: Utc::now() + chrono::Duration::seconds(60),
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.get_valid_token().await }));
        }
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.access_token, "tok-2");
            assert!(token.remaining_secs() > 120);
        }
    }

    #[tokio::test]
    async fn test_slow_refresh_outlives_lease_ttl_without_duplicate_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/get_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-slow"))
                    .set_delay(Duration::from_millis(2000)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = PartnerSettings {
            base_url: server.uri(),
            corporation_id: "C100".into(),
            app_key: "storewatch".into(),
            secret: "s3cr3t".into(),
            auth_retry_max_secs: 1,
            refresh_lease_ttl_secs: 1,
            refresh_wait_secs: 10,
            ..Default::default()
        };
        let store = Arc::new(TokenStore::new(
            reqwest::Client::new(),
            settings,
            Arc::new(SqliteCacheStore::new(db.cache())),
            Arc::new(SqliteLeaseStore::new(db.leases())),
        ));

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.get_valid_token().await })
        };
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let second = store.get_valid_token().await.unwrap();

        assert_eq!(first.await.unwrap().unwrap().access_token, "tok-slow");
        assert_eq!(second.access_token, "tok-slow");
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/get_token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad signature"))
            .expect(1)
            .mount(&server)
            .await;

        let store = token_store(&server).await;
        let err = store.get_valid_token().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_nonzero_envelope_code_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/get_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "code": 40003, "message": "app key disabled" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = token_store(&server).await;
        let err = store.get_valid_token().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_force_refresh_skips_when_peer_already_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/get_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-3")))
            .expect(1)
            .mount(&server)
            .await;

        let store = token_store(&server).await;
        let first = store.get_valid_token().await.unwrap();
        assert_eq!(first.access_token, "tok-3");

        // A caller still holding an older token sees the current one
        let current = store.force_refresh("tok-older").await.unwrap();
        assert_eq!(current.access_token, "tok-3");

        store.invalidate().await.unwrap();
        assert!(store.shared_token().await.unwrap().is_none());
    }
}
