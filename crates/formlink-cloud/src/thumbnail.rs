//! # Thumbnail Cache
//!
//! Holds the last displayable image per print job and re-resolves signed
//! URLs once the vendor's link has expired.
//!
//! ```text
//! get(job_id, descriptor)
//!     │
//!     ├── cached, same or re-resolved-from URL, ─────► cached bytes (fresh)
//!     │   not expired
//!     │
//!     ├── descriptor expired ──► get_thumbnail_url(job_id) ──┐
//!     │                                                      │
//!     └── URL rotated / entry expired ───────────────────────┤
//!                                                            ▼
//!                                               fetch_image(signed URL)
//!                                                 │               │
//!                                                Ok              Err
//!                                                 │               │
//!                                       replace entry      keep last bytes
//!                                       evict LRU > cap    (served, not fresh)
//! ```
//!
//! The lock is only held to read or swap an entry, never across a fetch.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use formlink_core::ThumbnailDescriptor;

use crate::client::CloudApi;
use crate::error::CloudResult;

/// Default cap on cached images.
pub const DEFAULT_MAX_ENTRIES: usize = 16;

/// Image bytes for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub bytes: Arc<[u8]>,
    pub source_url: String,
    pub expires_at: DateTime<Utc>,
    /// False when a refresh failed and the last valid bytes were served.
    pub fresh: bool,
}

#[derive(Debug)]
struct CacheEntry {
    bytes: Arc<[u8]>,
    source_url: String,
    /// Descriptor URL the caller held when this entry was fetched. Differs
    /// from `source_url` after an expired link was re-resolved.
    resolved_from: String,
    expires_at: DateTime<Utc>,
    last_used: u64,
}

impl CacheEntry {
    fn to_thumbnail(&self, fresh: bool) -> Thumbnail {
        Thumbnail {
            bytes: self.bytes.clone(),
            source_url: self.source_url.clone(),
            expires_at: self.expires_at,
            fresh,
        }
    }
}

/// Bounded job id → image cache.
pub struct ThumbnailCache {
    api: Arc<dyn CloudApi>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    tick: AtomicU64,
    max_entries: usize,
}

impl ThumbnailCache {
    pub fn new(api: Arc<dyn CloudApi>, max_entries: usize) -> Self {
        ThumbnailCache {
            api,
            entries: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
            max_entries: max_entries.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the image for `job_id`, fetching it when the cache has no
    /// usable copy for `descriptor`.
    pub async fn get(&self, job_id: &str, descriptor: &ThumbnailDescriptor) -> CloudResult<Thumbnail> {
        self.get_at(job_id, descriptor, Utc::now()).await
    }

    async fn get_at(
        &self,
        job_id: &str,
        descriptor: &ThumbnailDescriptor,
        now: DateTime<Utc>,
    ) -> CloudResult<Thumbnail> {
        if let Some(hit) = self.lookup(job_id, |entry| {
            (entry.source_url == descriptor.url || entry.resolved_from == descriptor.url)
                && now < entry.expires_at
        }) {
            debug!(job_id, "Thumbnail cache hit");
            return Ok(hit);
        }

        let requested_url = descriptor.url.clone();
        let descriptor = if descriptor.is_expired(now) {
            debug!(job_id, "Signed thumbnail URL expired, re-resolving");
            match self.api.get_thumbnail_url(job_id).await {
                Ok(resolved) => resolved,
                Err(err) => return self.fallback(job_id, err),
            }
        } else {
            descriptor.clone()
        };

        match self.api.fetch_image(&descriptor.url).await {
            Ok(bytes) => {
                let entry = CacheEntry {
                    bytes: Arc::from(bytes),
                    source_url: descriptor.url,
                    resolved_from: requested_url,
                    expires_at: descriptor.expires_at,
                    last_used: self.next_tick(),
                };
                let thumbnail = entry.to_thumbnail(true);

                let mut entries = self.entries();
                entries.insert(job_id.to_string(), entry);
                evict_lru(&mut entries, self.max_entries);
                Ok(thumbnail)
            }
            Err(err) => self.fallback(job_id, err),
        }
    }

    /// Last valid bytes after a failed refresh, or the error when none exist.
    fn fallback(&self, job_id: &str, err: crate::error::CloudError) -> CloudResult<Thumbnail> {
        match self.lookup(job_id, |_| true) {
            Some(stale) => {
                warn!(job_id, error = %err, "Thumbnail refresh failed, serving last image");
                Ok(Thumbnail { fresh: false, ..stale })
            }
            None => Err(err),
        }
    }

    fn lookup(&self, job_id: &str, usable: impl Fn(&CacheEntry) -> bool) -> Option<Thumbnail> {
        let tick = self.next_tick();
        let mut entries = self.entries();
        let entry = entries.get_mut(job_id).filter(|e| usable(e))?;
        entry.last_used = tick;
        Some(entry.to_thumbnail(true))
    }

    /// Whatever is cached for `job_id`, without touching the network.
    pub fn cached(&self, job_id: &str) -> Option<Thumbnail> {
        let now = Utc::now();
        self.lookup(job_id, |_| true).map(|t| Thumbnail {
            fresh: now < t.expires_at,
            ..t
        })
    }

    /// Drops entries for jobs no printer references any more, then enforces
    /// the size cap. Returns how many entries were removed.
    pub fn sweep(&self, referenced: &HashSet<String>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|job_id, _| referenced.contains(job_id));
        evict_lru(&mut entries, self.max_entries);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept thumbnail cache");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_lru(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
    while entries.len() > max_entries {
        let oldest = entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                entries.remove(&id);
            }
            None => break,
        }
    }
}
