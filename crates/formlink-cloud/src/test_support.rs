//! Shared fixtures for the crate's unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use formlink_core::ThumbnailDescriptor;

use crate::client::{printer_serial, CloudApi};
use crate::error::{CloudError, CloudResult};

/// Serves `router` on an ephemeral localhost port and returns its base URL.
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// In-memory vendor cloud with scriptable responses.
#[derive(Default)]
pub(crate) struct FakeCloud {
    printers: Mutex<HashMap<String, CloudResult<Value>>>,
    jobs: Mutex<HashMap<String, Value>>,
    thumbnail_urls: Mutex<HashMap<String, CloudResult<ThumbnailDescriptor>>>,
    images: Mutex<HashMap<String, CloudResult<Vec<u8>>>>,
    delay: Mutex<Option<Duration>>,
    list_error: Mutex<Option<CloudError>>,
    pub list_calls: AtomicUsize,
    pub printer_calls: AtomicUsize,
    pub job_calls: AtomicUsize,
    pub thumbnail_url_calls: AtomicUsize,
    pub image_calls: AtomicUsize,
}

impl FakeCloud {
    pub fn set_printer(&self, serial: &str, response: CloudResult<Value>) {
        self.printers.lock().unwrap().insert(serial.to_string(), response);
    }

    pub fn set_job(&self, job_id: &str, body: Value) {
        self.jobs.lock().unwrap().insert(job_id.to_string(), body);
    }

    pub fn set_thumbnail_url(&self, job_id: &str, response: CloudResult<ThumbnailDescriptor>) {
        self.thumbnail_urls
            .lock()
            .unwrap()
            .insert(job_id.to_string(), response);
    }

    pub fn set_image(&self, url: &str, response: CloudResult<Vec<u8>>) {
        self.images.lock().unwrap().insert(url.to_string(), response);
    }

    /// Makes `list_printers` fail until cleared with `None`.
    pub fn set_list_error(&self, error: Option<CloudError>) {
        *self.list_error.lock().unwrap() = error;
    }

    /// Every printer request sleeps this long first.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn list_printers(&self) -> CloudResult<Vec<Value>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_error.lock().unwrap().clone() {
            return Err(err);
        }
        let printers = self.printers.lock().unwrap();
        let mut list: Vec<Value> = printers
            .values()
            .filter_map(|r| r.as_ref().ok().cloned())
            .filter(|p| printer_serial(p).is_some())
            .collect();
        list.sort_by(|a, b| printer_serial(a).cmp(&printer_serial(b)));
        Ok(list)
    }

    async fn get_printer(&self, serial: &str) -> CloudResult<Value> {
        self.printer_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;
        let response = self.printers.lock().unwrap().get(serial).cloned();
        response.unwrap_or_else(|| {
            Err(CloudError::UnexpectedStatus {
                status: 404,
                body: String::new(),
            })
        })
    }

    async fn get_job(&self, _printer_serial: &str, job_id: &str) -> CloudResult<Value> {
        self.job_calls.fetch_add(1, Ordering::SeqCst);
        let body = self.jobs.lock().unwrap().get(job_id).cloned();
        body.ok_or(CloudError::UnexpectedStatus {
            status: 404,
            body: String::new(),
        })
    }

    async fn get_thumbnail_url(&self, job_id: &str) -> CloudResult<ThumbnailDescriptor> {
        self.thumbnail_url_calls.fetch_add(1, Ordering::SeqCst);
        let response = self.thumbnail_urls.lock().unwrap().get(job_id).cloned();
        response.unwrap_or_else(|| Err(CloudError::DeserializationFailed("no thumbnail".into())))
    }

    async fn fetch_image(&self, url: &str) -> CloudResult<Vec<u8>> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        let response = self.images.lock().unwrap().get(url).cloned();
        response.unwrap_or_else(|| {
            Err(CloudError::UnexpectedStatus {
                status: 404,
                body: String::new(),
            })
        })
    }
}
