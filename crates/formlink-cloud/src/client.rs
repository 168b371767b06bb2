//! # Cloud Client
//!
//! Typed request layer over the vendor REST API.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  GET {base}/printers/                          list_printers()          │
//! │  GET {base}/printers/{serial}/                 get_printer(serial)      │
//! │  GET {base}/printers/{serial}/prints/{job}/    get_job(serial, job)     │
//! │  GET {base}/prints/{job}/thumbnail/            get_thumbnail_url(job)   │
//! │  GET <signed url>  (no Authorization header)   fetch_image(url)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Retry Policy
//! One retry, only for 401/403: the rejected token is invalidated (once,
//! however many requests saw it) and the request is replayed with a fresh
//! token. A second rejection surfaces as [`CloudError::AuthRejected`].
//! Timeouts, resets and 5xx surface immediately as transient errors; the
//! poller owns backoff.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use formlink_core::{Normalizer, ThumbnailDescriptor};

use crate::config::BridgeConfig;
use crate::error::{CloudError, CloudResult};
use crate::token::{AccessToken, TokenManager};

/// Error bodies are cut to this many characters before they go into errors.
const MAX_ERROR_BODY: usize = 256;

// =============================================================================
// Cloud API Trait
// =============================================================================

/// Operations the poller and thumbnail cache need from the vendor cloud.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Raw printer objects. Entries without a serial are dropped.
    async fn list_printers(&self) -> CloudResult<Vec<Value>>;

    async fn get_printer(&self, serial: &str) -> CloudResult<Value>;

    async fn get_job(&self, printer_serial: &str, job_id: &str) -> CloudResult<Value>;

    /// Resolves a fresh signed thumbnail URL for a job.
    async fn get_thumbnail_url(&self, job_id: &str) -> CloudResult<ThumbnailDescriptor>;

    /// Downloads signed image bytes.
    async fn fetch_image(&self, url: &str) -> CloudResult<Vec<u8>>;
}

/// Serial of a raw printer object, if it has a usable one.
pub fn printer_serial(printer: &Value) -> Option<&str> {
    printer
        .get("serial")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

// =============================================================================
// HTTP Client
// =============================================================================

/// reqwest-backed [`CloudApi`].
pub struct CloudClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    tokens: Arc<TokenManager>,
    normalizer: Normalizer,
}

impl CloudClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        timeout: Duration,
        tokens: Arc<TokenManager>,
        normalizer: Normalizer,
    ) -> Self {
        CloudClient {
            http,
            base_url,
            timeout,
            tokens,
            normalizer,
        }
    }

    pub fn from_config(
        http: reqwest::Client,
        config: &BridgeConfig,
        tokens: Arc<TokenManager>,
        normalizer: Normalizer,
    ) -> CloudResult<Self> {
        Ok(CloudClient::new(
            http,
            config.base_url()?,
            config.request_timeout(),
            tokens,
            normalizer,
        ))
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// `{base}/a/b/` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> CloudResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CloudError::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments)
            .push("");
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> CloudResult<Value> {
        let token = self.tokens.get_valid_access_token().await?;

        match self.send_authorized(&url, &token).await {
            Err(CloudError::AuthRejected(reason)) => {
                warn!(url = %url.path(), %reason, "Access token rejected, refreshing once");
                self.tokens.invalidate_if_current(&token).await;
                let token = self.tokens.get_valid_access_token().await?;
                self.send_authorized(&url, &token).await
            }
            other => other,
        }
    }

    async fn send_authorized(&self, url: &Url, token: &AccessToken) -> CloudResult<Value> {
        debug!(url = %url.path(), "GET");

        let response = self
            .http
            .get(url.clone())
            .header(reqwest::header::AUTHORIZATION, token.header_value())
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response.json::<Value>().await?);
        }

        let body = truncate(response.text().await.unwrap_or_default());
        Err(CloudError::from_status(status, body))
    }
}

#[async_trait]
impl CloudApi for CloudClient {
    async fn list_printers(&self) -> CloudResult<Vec<Value>> {
        let body = self.get_json(self.endpoint(&["printers"])?).await?;

        let entries = match body {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("results") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(CloudError::DeserializationFailed(
                        "printer list is neither an array nor a results envelope".into(),
                    ))
                }
            },
            _ => {
                return Err(CloudError::DeserializationFailed(
                    "printer list is not JSON array".into(),
                ))
            }
        };

        Ok(entries
            .into_iter()
            .filter(|printer| {
                let keep = printer_serial(printer).is_some();
                if !keep {
                    debug!("Skipping printer entry without serial");
                }
                keep
            })
            .collect())
    }

    async fn get_printer(&self, serial: &str) -> CloudResult<Value> {
        self.get_json(self.endpoint(&["printers", serial])?).await
    }

    async fn get_job(&self, printer_serial: &str, job_id: &str) -> CloudResult<Value> {
        self.get_json(self.endpoint(&["printers", printer_serial, "prints", job_id])?)
            .await
    }

    async fn get_thumbnail_url(&self, job_id: &str) -> CloudResult<ThumbnailDescriptor> {
        let body = self.get_json(self.endpoint(&["prints", job_id, "thumbnail"])?).await?;
        self.normalizer
            .thumbnail_descriptor(&body, Utc::now())
            .ok_or_else(|| CloudError::DeserializationFailed(format!("no thumbnail URL for job {job_id}")))
    }

    async fn fetch_image(&self, url: &str) -> CloudResult<Vec<u8>> {
        let url = Url::parse(url)?;
        let response = self.http.get(url).timeout(self.timeout).send().await?;

        // An expired signature answers 403; that says nothing about the
        // account's credentials.
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(match status {
                500..=599 => CloudError::ServerError { status },
                _ => CloudError::UnexpectedStatus {
                    status,
                    body: String::new(),
                },
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use crate::token::Credential;
    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Vendor mock whose token endpoint issues `access-N` and whose API only
    /// accepts the most recently issued token.
    #[derive(Clone, Default)]
    struct Vendor {
        token_calls: Arc<AtomicUsize>,
        api_calls: Arc<AtomicUsize>,
        accepted: Arc<Mutex<Option<String>>>,
    }

    impl Vendor {
        fn authorized(&self, headers: &HeaderMap) -> bool {
            let expected = self.accepted.lock().unwrap().clone();
            let got = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            matches!((expected, got), (Some(e), Some(g)) if g == format!("Bearer {e}"))
        }
    }

    async fn token(State(vendor): State<Vendor>) -> Json<Value> {
        let n = vendor.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("access-{n}");
        *vendor.accepted.lock().unwrap() = Some(token.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Json(json!({ "access_token": token, "expires_in": 3600 }))
    }

    async fn printers(State(vendor): State<Vendor>, headers: HeaderMap) -> Response {
        vendor.api_calls.fetch_add(1, Ordering::SeqCst);
        if !vendor.authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!({
            "results": [
                { "serial": "Form4-Bright-Otter", "machine_type_id": "FORM-4-0" },
                { "alias": "no serial here" }
            ]
        }))
        .into_response()
    }

    async fn printer(Path(serial): Path<String>, State(vendor): State<Vendor>, headers: HeaderMap) -> Response {
        if !vendor.authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match serial.as_str() {
            "broken" => StatusCode::BAD_GATEWAY.into_response(),
            "missing" => (StatusCode::NOT_FOUND, "no such printer").into_response(),
            _ => Json(json!({ "serial": serial })).into_response(),
        }
    }

    async fn job(Path((serial, job)): Path<(String, String)>) -> Json<Value> {
        Json(json!({ "guid": job, "printer": serial, "status": "PRINTING" }))
    }

    async fn thumbnail(Path(job): Path<String>) -> Json<Value> {
        Json(json!({ "thumbnail": format!("https://cdn.invalid/{job}.png"), "expires_at": "2030-01-01T00:00:00Z" }))
    }

    fn router(vendor: Vendor) -> Router {
        Router::new()
            .route("/o/token/", post(token))
            .route("/developer/v1/printers/", get(printers))
            .route("/developer/v1/printers/{serial}/", get(printer))
            .route("/developer/v1/printers/{serial}/prints/{job}/", get(job))
            .route("/developer/v1/prints/{job}/thumbnail/", get(thumbnail))
            .route("/signed/ok.png", get(|| async { vec![1u8, 2, 3] }))
            .route("/signed/expired.png", get(|| async { StatusCode::FORBIDDEN }))
            .with_state(vendor)
    }

    async fn client(vendor: Vendor) -> (CloudClient, String) {
        let base = serve(router(vendor)).await;
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            Url::parse(&format!("{base}/o/token/")).unwrap(),
            Duration::from_secs(5),
            Credential::new("client", "secret", None),
        ));
        let client = CloudClient::new(
            http,
            Url::parse(&format!("{base}/developer/v1")).unwrap(),
            Duration::from_secs(5),
            tokens,
            Normalizer::default(),
        );
        (client, base)
    }

    #[tokio::test]
    async fn test_list_printers_unwraps_envelope_and_skips_serialless() {
        let vendor = Vendor::default();
        let (client, _) = client(vendor.clone()).await;

        let printers = client.list_printers().await.unwrap();
        assert_eq!(printers.len(), 1);
        assert_eq!(printer_serial(&printers[0]), Some("Form4-Bright-Otter"));
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_for_concurrent_requests() {
        let vendor = Vendor::default();
        let (client, _) = client(vendor.clone()).await;
        let client = Arc::new(client);

        client.list_printers().await.unwrap();
        assert_eq!(vendor.token_calls.load(Ordering::SeqCst), 1);

        // Vendor revokes the token behind our back.
        *vendor.accepted.lock().unwrap() = None;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.list_printers().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 1);
        }

        assert_eq!(vendor.token_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.tokens().refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_second_rejection_is_auth_error() {
        let router = Router::new()
            .route(
                "/o/token/",
                post(|| async { Json(json!({ "access_token": "never-accepted" })) }),
            )
            .route("/developer/v1/printers/", get(|| async { StatusCode::FORBIDDEN }));
        let base = serve(router).await;
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            Url::parse(&format!("{base}/o/token/")).unwrap(),
            Duration::from_secs(5),
            Credential::new("client", "secret", None),
        ));
        let client = CloudClient::new(
            http,
            Url::parse(&format!("{base}/developer/v1")).unwrap(),
            Duration::from_secs(5),
            tokens.clone(),
            Normalizer::default(),
        );

        let err = client.list_printers().await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(tokens.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_status_mapping_for_printer_detail() {
        let (client, _) = client(Vendor::default()).await;

        let ok = client.get_printer("Form 4 #1").await.unwrap();
        assert_eq!(ok["serial"], "Form 4 #1");

        assert!(client.get_printer("broken").await.unwrap_err().is_transient());
        assert!(matches!(
            client.get_printer("missing").await.unwrap_err(),
            CloudError::UnexpectedStatus { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn test_job_and_thumbnail_endpoints() {
        let (client, _) = client(Vendor::default()).await;

        let job = client.get_job("Form4-Bright-Otter", "run-7").await.unwrap();
        assert_eq!(job["guid"], "run-7");
        assert_eq!(job["printer"], "Form4-Bright-Otter");

        let thumb = client.get_thumbnail_url("run-7").await.unwrap();
        assert_eq!(thumb.url, "https://cdn.invalid/run-7.png");
        assert_eq!(thumb.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_fetch_image() {
        let (client, base) = client(Vendor::default()).await;

        let bytes = client.fetch_image(&format!("{base}/signed/ok.png")).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        let err = client
            .fetch_image(&format!("{base}/signed/expired.png"))
            .await
            .unwrap_err();
        assert!(!err.is_auth());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            Url::parse("http://127.0.0.1:9/o/token/").unwrap(),
            Duration::from_secs(2),
            Credential::new("client", "secret", None),
        ));
        let client = CloudClient::new(
            http,
            Url::parse("http://127.0.0.1:9/developer/v1").unwrap(),
            Duration::from_secs(2),
            tokens,
            Normalizer::default(),
        );

        assert!(client.list_printers().await.unwrap_err().is_transient());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(200);
        let cut = truncate(long);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
