//! # OAuth2 Token Manager
//!
//! Owns the single [`Credential`] and the access-token lifecycle.
//!
//! ## Refresh Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Token Refresh Flow                                │
//! │                                                                         │
//! │  caller ──get_valid_access_token()──► read lock                         │
//! │                                         │                               │
//! │                      valid for ≥ 60s? ──┴── yes ──► cached token        │
//! │                                         │ no                            │
//! │                                         ▼                               │
//! │                                    write lock (critical section)        │
//! │                                         │                               │
//! │                      refreshed by someone else meanwhile? ── yes ──►    │
//! │                                         │ no                 return it  │
//! │                                         ▼                               │
//! │       POST token_url  grant_type=refresh_token | client_credentials     │
//! │                                         │                               │
//! │            200 ──► replace Credential (rotated refresh token kept)      │
//! │    400/401/403 ──► AuthRejected (re-authorization required)             │
//! │     5xx / I/O  ──► transient error                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent callers queue on the write lock, so exactly one token request
//! is in flight per credential set.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BridgeConfig;
use crate::error::{CloudError, CloudResult};

/// Tokens are refreshed when they expire within this margin.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

// =============================================================================
// Credential
// =============================================================================

/// OAuth credentials plus the current access token.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_access_token", &self.access_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Credential {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token,
            ..Default::default()
        }
    }

    /// Access token that stays valid for at least `margin` past `now`.
    fn valid_token(&self, now: DateTime<Utc>, margin: ChronoDuration) -> Option<AccessToken> {
        let token = self.access_token.as_ref()?;
        let expires_at = self.expires_at?;
        if now + margin >= expires_at {
            return None;
        }
        Some(AccessToken {
            token: token.clone(),
            token_type: self.token_type.clone().unwrap_or_else(|| "Bearer".to_string()),
        })
    }

    fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        self.expires_at
            .map(|at| (at - now).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Access token ready to attach to a request.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub token_type: String,
}

impl AccessToken {
    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Token Endpoint Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<f64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

// =============================================================================
// Token Manager
// =============================================================================

/// Token manager shared by every cloud request.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: Url,
    timeout: Duration,
    credential: RwLock<Credential>,
    refresh_count: AtomicU64,
    rotated_refresh_token: watch::Sender<Option<String>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, token_url: Url, timeout: Duration, credential: Credential) -> Self {
        let (rotated_refresh_token, _) = watch::channel(credential.refresh_token.clone());
        TokenManager {
            http,
            token_url,
            timeout,
            credential: RwLock::new(credential),
            refresh_count: AtomicU64::new(0),
            rotated_refresh_token,
        }
    }

    /// Builds a manager from the bridge configuration.
    pub fn from_config(http: reqwest::Client, config: &BridgeConfig) -> CloudResult<Self> {
        let credential = Credential::new(
            config.auth.client_id.clone(),
            config.auth.client_secret.clone(),
            config.auth.refresh_token.clone(),
        );
        Ok(TokenManager::new(http, config.token_url()?, config.token_timeout(), credential))
    }

    /// Returns an access token valid for at least the refresh margin,
    /// refreshing first when needed.
    pub async fn get_valid_access_token(&self) -> CloudResult<AccessToken> {
        let margin = ChronoDuration::seconds(REFRESH_MARGIN_SECS);

        {
            let credential = self.credential.read().await;
            if let Some(token) = credential.valid_token(Utc::now(), margin) {
                debug!(remaining_secs = credential.remaining_secs(Utc::now()), "Using cached token");
                return Ok(token);
            }
        }

        let mut credential = self.credential.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = credential.valid_token(Utc::now(), margin) {
            return Ok(token);
        }

        let grant = if credential.refresh_token.is_some() {
            "refresh_token"
        } else {
            "client_credentials"
        };

        let response = self.request_token(&credential, grant).await?;
        self.refresh_count.fetch_add(1, Ordering::Relaxed);

        let access_token = response.access_token.ok_or_else(|| {
            CloudError::DeserializationFailed("token response has no access_token".into())
        })?;
        let now = Utc::now();
        let expires_at = response
            .expires_in
            .map(|secs| secs as i64)
            .filter(|secs| *secs > 0)
            .and_then(ChronoDuration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or_else(|| now + ChronoDuration::seconds(DEFAULT_EXPIRES_IN_SECS));

        credential.access_token = Some(access_token);
        credential.token_type = response.token_type.filter(|t| !t.is_empty());
        credential.expires_at = Some(expires_at);
        if let Some(rotated) = response.refresh_token.filter(|t| !t.is_empty()) {
            if credential.refresh_token.as_deref() != Some(rotated.as_str()) {
                debug!("Refresh token rotated");
                credential.refresh_token = Some(rotated.clone());
                self.rotated_refresh_token.send_replace(Some(rotated));
            }
        }

        info!(grant, expires_in_secs = credential.remaining_secs(now), "Access token refreshed");

        credential
            .valid_token(now, ChronoDuration::zero())
            .ok_or_else(|| CloudError::DeserializationFailed("token expired on arrival".into()))
    }

    /// Forces the next call to refresh.
    pub async fn invalidate(&self) {
        let mut credential = self.credential.write().await;
        credential.access_token = None;
        credential.expires_at = None;
        debug!("Access token invalidated");
    }

    /// Invalidates only if `rejected` is still the current token. Requests
    /// that were all rejected with the same token cause one refresh total.
    pub async fn invalidate_if_current(&self, rejected: &AccessToken) -> bool {
        let mut credential = self.credential.write().await;
        if credential.access_token.as_deref() == Some(rejected.token.as_str()) {
            credential.access_token = None;
            credential.expires_at = None;
            debug!("Rejected access token invalidated");
            true
        } else {
            false
        }
    }

    /// Copy of the current credential, for persistence.
    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// True while a non-expired access token is held.
    pub async fn is_authenticated(&self) -> bool {
        self.credential
            .read()
            .await
            .valid_token(Utc::now(), ChronoDuration::zero())
            .is_some()
    }

    /// Notified whenever the token endpoint rotates the refresh token, so the
    /// new one can be persisted before the old one stops working.
    pub fn subscribe_refresh_token(&self) -> watch::Receiver<Option<String>> {
        self.rotated_refresh_token.subscribe()
    }

    /// Number of successful token requests made so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Relaxed)
    }

    async fn request_token(&self, credential: &Credential, grant: &str) -> CloudResult<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", grant),
            ("client_id", credential.client_id.as_str()),
        ];
        if !credential.client_secret.is_empty() {
            form.push(("client_secret", credential.client_secret.as_str()));
        }
        if let Some(refresh_token) = credential.refresh_token.as_deref() {
            form.push(("refresh_token", refresh_token));
        }

        debug!(url = %self.token_url, grant, "Requesting access token");

        let response = self
            .http
            .post(self.token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Token request failed");
                CloudError::from(e)
            })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response.json::<TokenResponse>().await?),
            400 | 401 | 403 => {
                let body: TokenErrorBody = response.json().await.unwrap_or_default();
                let reason = body
                    .error_description
                    .or(body.error)
                    .unwrap_or_else(|| format!("HTTP {status}"));
                warn!(status, %reason, "Token endpoint rejected credentials");
                Err(CloudError::AuthRejected(reason))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(CloudError::from_status(status, body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::{extract::State, http::StatusCode, routing::post, Form, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct TokenServer {
        calls: Arc<AtomicUsize>,
        forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    }

    async fn issue(
        State(server): State<TokenServer>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        let n = server.calls.fetch_add(1, Ordering::SeqCst) + 1;
        server.forms.lock().unwrap().push(form);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Json(json!({
            "access_token": format!("access-{n}"),
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": format!("refresh-{n}")
        }))
    }

    async fn manager_for(router: Router, refresh_token: Option<&str>) -> TokenManager {
        let base = serve(router).await;
        TokenManager::new(
            reqwest::Client::new(),
            Url::parse(&format!("{base}/o/token/")).unwrap(),
            Duration::from_secs(5),
            Credential::new("client", "secret", refresh_token.map(str::to_string)),
        )
    }

    fn token_router(server: TokenServer) -> Router {
        Router::new().route("/o/token/", post(issue)).with_state(server)
    }

    #[tokio::test]
    async fn test_client_credentials_grant_and_cache() {
        let server = TokenServer::default();
        let manager = manager_for(token_router(server.clone()), None).await;

        let first = manager.get_valid_access_token().await.unwrap();
        let second = manager.get_valid_access_token().await.unwrap();

        assert_eq!(first.token, "access-1");
        assert_eq!(first, second);
        assert_eq!(first.header_value(), "Bearer access-1");
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);

        let forms = server.forms.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "client_credentials");
        assert_eq!(forms[0]["client_id"], "client");
        assert!(manager.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_refresh_token_rotation_is_honored() {
        let server = TokenServer::default();
        let manager = manager_for(token_router(server.clone()), Some("refresh-0")).await;

        let mut rotations = manager.subscribe_refresh_token();
        manager.get_valid_access_token().await.unwrap();
        assert_eq!(manager.credential().await.refresh_token.as_deref(), Some("refresh-1"));
        assert!(rotations.has_changed().unwrap());
        assert_eq!(rotations.borrow_and_update().as_deref(), Some("refresh-1"));

        manager.invalidate().await;
        let token = manager.get_valid_access_token().await.unwrap();
        assert_eq!(token.token, "access-2");

        let forms = server.forms.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "refresh_token");
        assert_eq!(forms[0]["refresh_token"], "refresh-0");
        assert_eq!(forms[1]["refresh_token"], "refresh-1");
        assert_eq!(manager.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let server = TokenServer::default();
        let manager = Arc::new(manager_for(token_router(server.clone()), None).await);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_valid_access_token().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().token, "access-1");
        }

        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_if_current_ignores_old_tokens() {
        let server = TokenServer::default();
        let manager = manager_for(token_router(server.clone()), None).await;

        let first = manager.get_valid_access_token().await.unwrap();
        assert!(manager.invalidate_if_current(&first).await);
        let second = manager.get_valid_access_token().await.unwrap();

        // A late 401 for the first token must not throw away the second.
        assert!(!manager.invalidate_if_current(&first).await);
        assert_eq!(manager.get_valid_access_token().await.unwrap(), second);
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_is_auth_error() {
        let router = Router::new().route(
            "/o/token/",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_grant" })),
                )
            }),
        );
        let manager = manager_for(router, Some("revoked")).await;

        let err = manager.get_valid_access_token().await.unwrap_err();
        assert_eq!(err, CloudError::AuthRejected("invalid_grant".into()));
        assert!(!manager.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let router = Router::new().route("/o/token/", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let manager = manager_for(router, None).await;

        let err = manager.get_valid_access_token().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_defaults_to_one_hour() {
        let router = Router::new().route(
            "/o/token/",
            post(|| async { Json(json!({ "access_token": "a", "expires_in": 1e300 })) }),
        );
        let manager = manager_for(router, None).await;

        assert_eq!(manager.get_valid_access_token().await.unwrap().token, "a");
        let remaining = manager.credential().await.remaining_secs(Utc::now());
        assert!(remaining > 3500 && remaining <= 3600);
    }

    #[tokio::test]
    async fn test_missing_expiry_defaults_to_one_hour() {
        let router = Router::new().route(
            "/o/token/",
            post(|| async { Json(json!({ "access_token": "a" })) }),
        );
        let manager = manager_for(router, None).await;

        let token = manager.get_valid_access_token().await.unwrap();
        assert_eq!(token.token_type, "Bearer");

        let credential = manager.credential().await;
        let remaining = credential.remaining_secs(Utc::now());
        assert!(remaining > 3500 && remaining <= 3600);
        assert!(credential.refresh_token.is_none());
    }

    #[test]
    fn test_credential_debug_hides_secrets() {
        let mut credential = Credential::new("client", "very-secret", Some("rt".into()));
        credential.access_token = Some("at-123".into());
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("at-123"));
    }
}
